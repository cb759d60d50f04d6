//! Breakpoint management module.

use super::condition::{Condition, ConditionError};
use super::WatchKind;
use crate::memory::{LongAddress, MemoryModel};
use crate::registers::{RegisterSet, Z80Register};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request to arm a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub address: LongAddress,
    pub condition: Option<String>,
    /// Log message emitted instead of stopping. `{REG}` placeholders are
    /// replaced by register values.
    pub log: Option<String>,
}

impl BreakpointRequest {
    pub fn at(address: impl Into<LongAddress>) -> Self {
        Self { address: address.into(), condition: None, log: None }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// An armed breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: u32,
    pub address: LongAddress,
    pub condition: Option<String>,
    pub log: Option<String>,
    pub temporary: bool,
}

/// An armed watchpoint covering `size` bytes from `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Watchpoint {
    pub address: u16,
    pub size: u16,
    pub kind: WatchKind,
}

impl Watchpoint {
    pub const fn new(address: u16, size: u16, kind: WatchKind) -> Self {
        Self { address, size, kind }
    }

    pub fn contains(&self, address: u16) -> bool {
        address.wrapping_sub(self.address) < self.size.max(1)
    }
}

/// What to do after execution stopped on a breakpoint address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitOutcome {
    /// At least one breakpoint wants execution to stay halted.
    pub stop: bool,
    /// Messages produced by log points at this address.
    pub logs: Vec<String>,
}

/// Returns true iff one of the supplied addresses is an armed temporary breakpoint.
/// Absent candidates are skipped.
pub fn check_tmp_breakpoints(armed: &[u16], first: Option<u16>, second: Option<u16>) -> bool {
    [first, second].into_iter().flatten().any(|addr| armed.contains(&addr))
}

fn format_log(template: &str, regs: &RegisterSet) -> String {
    let mut message = template.to_string();
    for reg in Z80Register::ALL {
        let placeholder = format!("{{{}}}", reg.name());
        if message.contains(&placeholder) {
            let value = if reg.is_byte() {
                format!("{:02X}", regs.get(reg))
            } else {
                format!("{:04X}", regs.get(reg))
            };
            message = message.replace(&placeholder, &value);
        }
    }
    message
}

/// Bookkeeping for breakpoints, temporary breakpoints and watchpoints.
///
/// Tracks what is armed; arming on the target is up to the owning backend.
pub struct BreakpointManager {
    next_id: u32,
    breakpoints: Vec<Breakpoint>,
    conditions: HashMap<u32, Condition>,
    temporary: Vec<u16>,
    watchpoints: Vec<Watchpoint>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            breakpoints: Vec::new(),
            conditions: HashMap::new(),
            temporary: Vec::new(),
            watchpoints: Vec::new(),
        }
    }

    /// Add a breakpoint. Adding the same (address, condition) twice returns the
    /// existing breakpoint; the flag tells whether a new one was created.
    pub fn add(&mut self, request: BreakpointRequest) -> Result<(Breakpoint, bool), ConditionError> {
        if let Some(existing) = self
            .breakpoints
            .iter()
            .find(|bp| bp.address == request.address && bp.condition == request.condition)
        {
            return Ok((existing.clone(), false));
        }

        let condition = request.condition.as_deref().map(Condition::parse).transpose()?;
        let bp = Breakpoint {
            id: self.next_id,
            address: request.address,
            condition: request.condition,
            log: request.log,
            temporary: false,
        };
        self.next_id += 1;
        if let Some(condition) = condition {
            self.conditions.insert(bp.id, condition);
        }
        self.breakpoints.push(bp.clone());
        Ok((bp, true))
    }

    /// Remove a breakpoint by id.
    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        let index = self.breakpoints.iter().position(|bp| bp.id == id)?;
        self.conditions.remove(&id);
        Some(self.breakpoints.remove(index))
    }

    /// Remove the breakpoint that exactly matches (address, condition).
    pub fn remove_exact(&mut self, address: LongAddress, condition: Option<&str>) -> Option<Breakpoint> {
        let id = self
            .breakpoints
            .iter()
            .find(|bp| bp.address == address && bp.condition.as_deref() == condition)?
            .id;
        self.remove(id)
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.id == id)
    }

    /// Whether any other breakpoint is armed at the same address as `id`.
    pub fn address_shared(&self, id: u32) -> bool {
        self.get(id).is_some_and(|bp| {
            self.breakpoints.iter().any(|other| other.id != id && other.address == bp.address)
        })
    }

    /// List armed breakpoints, ordered by id.
    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Breakpoints at a CPU address given the current paging.
    pub fn at(&self, address: u16, model: MemoryModel, slots: &[u8]) -> Vec<&Breakpoint> {
        self.breakpoints.iter().filter(|bp| bp.address.matches(address, model, slots)).collect()
    }

    pub fn is_armed(&self, address: u16, model: MemoryModel, slots: &[u8]) -> bool {
        self.breakpoints.iter().any(|bp| bp.address.matches(address, model, slots))
    }

    /// Decide whether a stop at `address` should be reported, evaluating
    /// conditions and collecting log point output.
    ///
    /// A stop at an address without any known breakpoint is always reported.
    /// A stop on a breakpoint whose bank is not paged in is not: backends
    /// that arm by CPU address alone stop there in every bank.
    pub fn evaluate_hit(&self, address: u16, model: MemoryModel, regs: &RegisterSet) -> HitOutcome {
        let hits = self.at(address, model, &regs.slots);
        if hits.is_empty() {
            let other_bank = self.breakpoints.iter().any(|bp| bp.address.address() == address);
            return HitOutcome { stop: !other_bank, logs: Vec::new() };
        }
        let mut outcome = HitOutcome::default();
        for bp in hits {
            let satisfied = self.conditions.get(&bp.id).is_none_or(|cond| cond.evaluate(regs));
            if !satisfied {
                continue;
            }
            match &bp.log {
                Some(template) => outcome.logs.push(format_log(template, regs)),
                None => outcome.stop = true,
            }
        }
        outcome
    }

    /// Arm a temporary breakpoint. Returns false if it was already armed.
    pub fn arm_temporary(&mut self, address: u16) -> bool {
        if self.temporary.contains(&address) {
            return false;
        }
        self.temporary.push(address);
        true
    }

    pub fn temporary(&self) -> &[u16] {
        &self.temporary
    }

    pub fn check_tmp_breakpoints(&self, first: Option<u16>, second: Option<u16>) -> bool {
        check_tmp_breakpoints(&self.temporary, first, second)
    }

    /// Disarm all temporary breakpoints, returning the addresses that were armed.
    pub fn clear_temporary(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.temporary)
    }

    /// Add a watchpoint. Returns false if an identical one is already armed.
    pub fn add_watchpoint(&mut self, wp: Watchpoint) -> bool {
        if self.watchpoints.contains(&wp) {
            return false;
        }
        self.watchpoints.push(wp);
        true
    }

    pub fn remove_watchpoint(&mut self, wp: &Watchpoint) -> bool {
        let before = self.watchpoints.len();
        self.watchpoints.retain(|w| w != wp);
        before != self.watchpoints.len()
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    /// The first watchpoint triggered by an access of kind `access` at `address`.
    pub fn watch_hit(&self, address: u16, access: WatchKind) -> Option<Watchpoint> {
        self.watchpoints.iter().find(|wp| wp.contains(address) && wp.kind.covers(access)).copied()
    }

    /// Forget everything.
    pub fn clear_all(&mut self) {
        self.breakpoints.clear();
        self.conditions.clear();
        self.temporary.clear();
        self.watchpoints.clear();
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_manager_tracking() {
        let mut mgr = BreakpointManager::new();
        assert!(mgr.list().is_empty());

        let (bp, created) = mgr.add(BreakpointRequest::at(0x8000)).unwrap();
        assert!(created);
        assert_eq!(bp.id, 1);
        assert_eq!(mgr.list().len(), 1);
        assert!(mgr.is_armed(0x8000, MemoryModel::Unknown, &[0]));
        assert!(!mgr.is_armed(0x8001, MemoryModel::Unknown, &[0]));
    }

    #[test]
    fn test_insertion_is_idempotent_on_address_and_condition() {
        let mut mgr = BreakpointManager::new();
        let (first, _) = mgr.add(BreakpointRequest::at(0x8000)).unwrap();
        let (again, created) = mgr.add(BreakpointRequest::at(0x8000)).unwrap();
        assert!(!created);
        assert_eq!(first, again);

        let (conditional, created) =
            mgr.add(BreakpointRequest::at(0x8000).with_condition("A == 1")).unwrap();
        assert!(created);
        assert_ne!(conditional.id, first.id);
        assert_eq!(mgr.list().len(), 2);
        assert!(mgr.address_shared(first.id));
    }

    #[test]
    fn test_removal_is_exact_match() {
        let mut mgr = BreakpointManager::new();
        mgr.add(BreakpointRequest::at(0x8000).with_condition("A == 1")).unwrap();
        assert!(mgr.remove_exact(LongAddress::plain(0x8000), None).is_none());
        assert!(mgr.remove_exact(LongAddress::plain(0x8000), Some("A == 1")).is_some());
        assert!(mgr.is_empty());
        assert!(mgr.remove(42).is_none());
    }

    #[test]
    fn test_invalid_condition_is_rejected() {
        let mut mgr = BreakpointManager::new();
        let err = mgr.add(BreakpointRequest::at(0x8000).with_condition("A ==")).unwrap_err();
        assert_eq!(err.text, "A ==");
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_long_addresses_respect_paging() {
        let mut mgr = BreakpointManager::new();
        mgr.add(BreakpointRequest::at(LongAddress::banked(0xC000, 7))).unwrap();
        assert!(mgr.is_armed(0xC000, MemoryModel::Zx128k, &[8, 5, 2, 7]));
        assert!(!mgr.is_armed(0xC000, MemoryModel::Zx128k, &[8, 5, 2, 0]));
    }

    #[test]
    fn test_hit_in_other_bank_does_not_stop() {
        let mut mgr = BreakpointManager::new();
        mgr.add(BreakpointRequest::at(LongAddress::banked(0xC000, 7))).unwrap();

        let mut regs = RegisterSet { pc: 0xC000, slots: vec![8, 5, 2, 0], ..Default::default() };
        assert!(!mgr.evaluate_hit(0xC000, MemoryModel::Zx128k, &regs).stop);
        regs.slots = vec![8, 5, 2, 7];
        assert!(mgr.evaluate_hit(0xC000, MemoryModel::Zx128k, &regs).stop);
        // Unrelated addresses are still reported.
        assert!(mgr.evaluate_hit(0xC001, MemoryModel::Zx128k, &regs).stop);
    }

    #[test]
    fn test_evaluate_hit_conditions_and_logs() {
        let mut mgr = BreakpointManager::new();
        mgr.add(BreakpointRequest::at(0x8000).with_condition("A == 0x10")).unwrap();
        mgr.add(BreakpointRequest::at(0x9000).with_log("HL is {HL}, A is {A}")).unwrap();

        let mut regs = RegisterSet { af: 0x0F00, hl: 0xBEEF, slots: vec![0], ..Default::default() };
        assert!(!mgr.evaluate_hit(0x8000, MemoryModel::Unknown, &regs).stop);
        regs.af = 0x1000;
        assert!(mgr.evaluate_hit(0x8000, MemoryModel::Unknown, &regs).stop);

        let outcome = mgr.evaluate_hit(0x9000, MemoryModel::Unknown, &regs);
        assert!(!outcome.stop);
        assert_eq!(outcome.logs, vec!["HL is BEEF, A is 10".to_string()]);

        assert!(mgr.evaluate_hit(0x1234, MemoryModel::Unknown, &regs).stop);
    }

    #[test]
    fn test_check_tmp_breakpoints() {
        let mut mgr = BreakpointManager::new();
        assert!(!mgr.check_tmp_breakpoints(None, None));
        assert!(mgr.arm_temporary(0x8003));
        assert!(!mgr.arm_temporary(0x8003));
        assert!(!mgr.check_tmp_breakpoints(None, None));
        assert!(mgr.check_tmp_breakpoints(Some(0x8003), None));
        assert!(mgr.check_tmp_breakpoints(None, Some(0x8003)));
        assert!(mgr.check_tmp_breakpoints(Some(0x1000), Some(0x8003)));
        assert!(!mgr.check_tmp_breakpoints(Some(0x1000), Some(0x2000)));
        assert_eq!(mgr.clear_temporary(), vec![0x8003]);
        assert!(!mgr.check_tmp_breakpoints(Some(0x8003), None));
    }

    #[test]
    fn test_watchpoints() {
        let mut mgr = BreakpointManager::new();
        let wp = Watchpoint::new(0x4000, 4, WatchKind::Write);
        assert!(mgr.add_watchpoint(wp));
        assert!(!mgr.add_watchpoint(wp));
        assert_eq!(mgr.watch_hit(0x4003, WatchKind::Write), Some(wp));
        assert_eq!(mgr.watch_hit(0x4004, WatchKind::Write), None);
        assert_eq!(mgr.watch_hit(0x4000, WatchKind::Read), None);
        assert!(mgr.remove_watchpoint(&wp));
        assert!(!mgr.remove_watchpoint(&wp));
    }
}
