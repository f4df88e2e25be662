use crate::models::types::TerminalDims;

pub const IAC: u8 = 255; // Interpret As Command
pub const WILL: u8 = 251;
pub const WONT: u8 = 252;
pub const DO: u8 = 253;
pub const DONT: u8 = 254;
pub const SB: u8 = 250; // Subnegotiation begin
pub const SE: u8 = 240; // Subnegotiation end

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3; // Suppress Go-Ahead
pub const OPT_TTYPE: u8 = 24; // Terminal type
pub const OPT_NAWS: u8 = 31; // Negotiate About Window Size

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// Terminal type we advertise to remote servers.
pub const TERMINAL_TYPE: &[u8] = b"xterm";

/// Non-data events surfaced while filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IacEvent {
    /// The remote told us who owns echo. `true` means the server echoes
    /// and the client should stop local echo.
    EchoChanged { server_echo: bool },
}

/// Result of feeding received bytes through the filter.
#[derive(Debug, Default)]
pub struct Filtered {
    /// Data with all negotiation bytes stripped.
    pub payload: Vec<u8>,
    /// Negotiation responses to write back to the remote.
    pub replies: Vec<u8>,
    pub events: Vec<IacEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Cmd(u8),
    SbOpt,
    Sb,
    SbIac,
}

/// Client-side RFC 854 option filter for the outbound proxy. Recognises
/// WILL/WONT/DO/DONT and SB..SE, answers the subset mapscii-class servers
/// need (NAWS, TERMINAL-TYPE, SGA, ECHO ownership) and strips everything
/// else from the data stream.
#[derive(Debug)]
pub struct IacFilter {
    state: State,
    sb_opt: u8,
    sb_buf: Vec<u8>,
}

impl Default for IacFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl IacFilter {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            sb_opt: 0,
            sb_buf: Vec::with_capacity(16),
        }
    }

    /// Option announcement sent right after connect: we do terminal type
    /// and window size, we suppress go-ahead, we do not echo; then the
    /// live window size.
    pub fn initial_negotiation(dims: TerminalDims) -> Vec<u8> {
        let mut out = vec![
            IAC, WILL, OPT_TTYPE,
            IAC, WILL, OPT_NAWS,
            IAC, WILL, OPT_SGA,
            IAC, WONT, OPT_ECHO,
        ];
        out.extend_from_slice(&Self::naws_subnegotiation(dims));
        out
    }

    /// `IAC SB NAWS w-hi w-lo h-hi h-lo IAC SE` with the live dimensions.
    pub fn naws_subnegotiation(dims: TerminalDims) -> Vec<u8> {
        let [wh, wl] = dims.cols.to_be_bytes();
        let [hh, hl] = dims.rows.to_be_bytes();
        vec![IAC, SB, OPT_NAWS, wh, wl, hh, hl, IAC, SE]
    }

    /// Feed received bytes; negotiation is answered in `replies`, clean
    /// data accumulates in `payload`.
    pub fn feed(&mut self, input: &[u8], dims: TerminalDims) -> Filtered {
        let mut out = Filtered::default();
        for &b in input {
            self.push(b, dims, &mut out);
        }
        out
    }

    fn push(&mut self, b: u8, dims: TerminalDims, out: &mut Filtered) {
        match self.state {
            State::Data => {
                if b == IAC {
                    self.state = State::Iac;
                } else {
                    out.payload.push(b);
                }
            }
            State::Iac => match b {
                IAC => {
                    // Escaped 0xFF data byte
                    out.payload.push(IAC);
                    self.state = State::Data;
                }
                WILL | WONT | DO | DONT => self.state = State::Cmd(b),
                SB => self.state = State::SbOpt,
                _ => {
                    // NOP, GA, BRK and friends carry no option byte
                    self.state = State::Data;
                }
            },
            State::Cmd(cmd) => {
                self.negotiate(cmd, b, dims, out);
                self.state = State::Data;
            }
            State::SbOpt => {
                self.sb_opt = b;
                self.sb_buf.clear();
                self.state = State::Sb;
            }
            State::Sb => {
                if b == IAC {
                    self.state = State::SbIac;
                } else {
                    self.sb_buf.push(b);
                }
            }
            State::SbIac => {
                if b == SE {
                    self.subnegotiate(dims, out);
                    self.state = State::Data;
                } else if b == IAC {
                    self.sb_buf.push(IAC);
                    self.state = State::Sb;
                } else {
                    // Malformed subnegotiation; drop it
                    self.state = State::Data;
                }
            }
        }
    }

    fn negotiate(&mut self, cmd: u8, opt: u8, dims: TerminalDims, out: &mut Filtered) {
        match (cmd, opt) {
            (DO, OPT_NAWS) => {
                out.replies.extend_from_slice(&Self::naws_subnegotiation(dims));
            }
            (DO, OPT_TTYPE) => {
                out.replies.extend_from_slice(&[IAC, WILL, OPT_TTYPE]);
            }
            (DO, OPT_SGA) => {
                out.replies.extend_from_slice(&[IAC, WILL, OPT_SGA]);
            }
            (DO, opt) => {
                out.replies.extend_from_slice(&[IAC, WONT, opt]);
            }
            (WILL, OPT_ECHO) => {
                out.replies.extend_from_slice(&[IAC, DO, OPT_ECHO]);
                out.events.push(IacEvent::EchoChanged { server_echo: true });
            }
            (WONT, OPT_ECHO) => {
                out.replies.extend_from_slice(&[IAC, DONT, OPT_ECHO]);
                out.events.push(IacEvent::EchoChanged { server_echo: false });
            }
            (WILL, OPT_SGA) => {
                out.replies.extend_from_slice(&[IAC, DO, OPT_SGA]);
            }
            (WILL, opt) => {
                out.replies.extend_from_slice(&[IAC, DONT, opt]);
            }
            (DONT, _) | (WONT, _) => {
                // Nothing we rely on; acknowledge by silence
            }
            _ => {}
        }
    }

    fn subnegotiate(&mut self, _dims: TerminalDims, out: &mut Filtered) {
        if self.sb_opt == OPT_TTYPE && self.sb_buf.first() == Some(&TTYPE_SEND) {
            out.replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
            out.replies.extend_from_slice(TERMINAL_TYPE);
            out.replies.extend_from_slice(&[IAC, SE]);
        }
        self.sb_buf.clear();
    }
}
