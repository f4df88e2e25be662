use crate::config::LimitsConfig;
use crate::error::{AppError, AppResult};
use crate::models::types::SessionId;
use dashmap::DashMap;

/// Per-session and system-wide caps for the BASIC and telnet subsystems.
/// Acquisition rejects over-cap without mutating anything; release is
/// idempotent.
pub struct QuotaService {
    limits: LimitsConfig,
    basic: DashMap<SessionId, bool>,
    telnet: DashMap<SessionId, ()>,
}

impl QuotaService {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            basic: DashMap::new(),
            telnet: DashMap::new(),
        }
    }

    pub fn start_basic_session(&self, id: &SessionId, is_guest: bool) -> AppResult<()> {
        if self.basic.contains_key(id) {
            return Ok(());
        }
        self.basic.insert(id.clone(), is_guest);
        let total = self.basic.len();
        let guests = self.basic.iter().filter(|e| *e.value()).count();
        if total > self.limits.max_basic_sessions
            || (is_guest && guests > self.limits.max_guest_basic_sessions)
        {
            self.basic.remove(id);
            return Err(AppError::Capacity(format!(
                "all BASIC slots are in use ({} of {})",
                total - 1,
                self.limits.max_basic_sessions
            )));
        }
        Ok(())
    }

    pub fn end_basic_session(&self, id: &SessionId) {
        self.basic.remove(id);
    }

    pub fn try_acquire_telnet(&self, id: &SessionId) -> AppResult<()> {
        if self.telnet.contains_key(id) {
            return Err(AppError::Capacity("session already has a telnet connection".into()));
        }
        self.telnet.insert(id.clone(), ());
        if self.telnet.len() > self.limits.max_telnet_sessions {
            self.telnet.remove(id);
            return Err(AppError::Capacity(format!(
                "all {} telnet slots are in use",
                self.limits.max_telnet_sessions
            )));
        }
        Ok(())
    }

    pub fn release_telnet(&self, id: &SessionId) {
        self.telnet.remove(id);
    }

    pub fn basic_in_use(&self) -> usize {
        self.basic.len()
    }

    pub fn telnet_in_use(&self) -> usize {
        self.telnet.len()
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(max_basic: usize, max_guest: usize, max_telnet: usize) -> QuotaService {
        QuotaService::new(LimitsConfig {
            max_basic_sessions: max_basic,
            max_guest_basic_sessions: max_guest,
            max_telnet_sessions: max_telnet,
            ..LimitsConfig::default()
        })
    }

    #[test]
    fn basic_cap_rejects_without_mutating() {
        let q = quota(2, 1, 10);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();
        q.start_basic_session(&a, false).unwrap();
        q.start_basic_session(&b, false).unwrap();
        assert!(q.start_basic_session(&c, false).is_err());
        assert_eq!(q.basic_in_use(), 2);
    }

    #[test]
    fn guest_cap_is_stricter() {
        let q = quota(10, 1, 10);
        let a = SessionId::new();
        let b = SessionId::new();
        q.start_basic_session(&a, true).unwrap();
        assert!(q.start_basic_session(&b, true).is_err());
        assert!(q.start_basic_session(&b, false).is_ok());
    }

    #[test]
    fn end_basic_is_idempotent() {
        let q = quota(1, 1, 1);
        let a = SessionId::new();
        q.start_basic_session(&a, false).unwrap();
        q.end_basic_session(&a);
        q.end_basic_session(&a);
        assert_eq!(q.basic_in_use(), 0);
    }

    #[test]
    fn telnet_cap_and_duplicate_sessions() {
        let q = quota(1, 1, 1);
        let a = SessionId::new();
        let b = SessionId::new();
        q.try_acquire_telnet(&a).unwrap();
        assert!(q.try_acquire_telnet(&a).is_err());
        assert!(q.try_acquire_telnet(&b).is_err());
        q.release_telnet(&a);
        assert!(q.try_acquire_telnet(&b).is_ok());
    }
}
