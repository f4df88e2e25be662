use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::{SessionId, TerminalDims};
use dashmap::DashMap;
use std::sync::Arc;

/// Status line width never exceeds this, however wide the terminal says
/// it is.
pub const MAX_STATUS_WIDTH: usize = 120;

pub struct CatPagerState {
    lines: Vec<String>,
    index: usize,
    page_size: usize,
    filename: String,
    dims: TerminalDims,
}

/// One-screenful-at-a-time file display. Activation tells the frontend to
/// switch to single-key input; deactivation reverses it.
#[derive(Default)]
pub struct PagerManager {
    pagers: DashMap<SessionId, CatPagerState>,
}

impl PagerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.pagers.contains_key(id)
    }

    pub fn remove(&self, id: &SessionId) {
        self.pagers.remove(id);
    }

    /// Returns true when the content needs paging at these dimensions.
    pub fn needs_paging(content: &str, dims: TerminalDims) -> bool {
        content.lines().count() > page_size(dims)
    }

    /// Start paging; emits the activation message and the first page.
    pub fn open(
        &self,
        id: &SessionId,
        filename: &str,
        content: &str,
        dims: TerminalDims,
    ) -> Vec<Message> {
        let state = CatPagerState {
            lines: content.lines().map(str::to_string).collect(),
            index: 0,
            page_size: page_size(dims),
            filename: filename.to_string(),
            dims,
        };
        let mut msgs = vec![Message::pager("activate"), Message::input_control("singlekey:on")];
        msgs.extend(render_page(&state));
        self.pagers.insert(id.clone(), state);
        msgs
    }

    pub fn handle_input(&self, id: &SessionId, input: &str) -> AdapterReply {
        let key = input.trim().to_lowercase();
        if is_exit_key(input) || key == "q" {
            self.remove(id);
            return AdapterReply::exit(deactivation());
        }
        let Some(mut state) = self.pagers.get_mut(id) else {
            return AdapterReply::exit(vec![]);
        };
        match key.as_str() {
            // One page back
            "b" => {
                state.index = state.index.saturating_sub(state.page_size);
                AdapterReply::stay(render_page(&state))
            }
            // Space or enter advances
            "" | " " | "f" => {
                if state.index + state.page_size >= state.lines.len() {
                    // EOF
                    drop(state);
                    self.remove(id);
                    return AdapterReply::exit(deactivation());
                }
                state.index += state.page_size;
                AdapterReply::stay(render_page(&state))
            }
            _ => AdapterReply::stay(vec![Message::text(
                "space: next page, b: back, q: quit".to_string(),
            )]),
        }
    }
}

fn page_size(dims: TerminalDims) -> usize {
    (dims.rows.saturating_sub(1) as usize).max(1)
}

fn deactivation() -> Vec<Message> {
    vec![Message::pager("deactivate"), Message::input_control("singlekey:off")]
}

fn render_page(state: &CatPagerState) -> Vec<Message> {
    let end = (state.index + state.page_size).min(state.lines.len());
    let mut msgs: Vec<Message> = state.lines[state.index..end]
        .iter()
        .map(|l| Message::text(l.as_str()))
        .collect();
    msgs.push(Message::text(status_line(state, end)));
    msgs
}

fn status_line(state: &CatPagerState, end: usize) -> String {
    let total = state.lines.len();
    let pct = if total == 0 { 100 } else { end * 100 / total };
    let line = format!(
        "-- {} [{}-{}/{} {}%] (space: next, b: back, q: quit) --",
        state.filename,
        state.index + 1,
        end,
        total,
        pct
    );
    let width = (state.dims.cols as usize).min(MAX_STATUS_WIDTH);
    line.chars().take(width).collect()
}
