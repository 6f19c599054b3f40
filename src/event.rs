//! Cluster event derivation from status transitions.
//!
//! A monitor derives at most one event per server per tick from the
//! (previous, current) status pair. Events have stable names that appear in
//! operator logs, the `events` subscription list and `$EVENT` script
//! expansions.

use serde::Deserialize;

use crate::status::ServerStatus;

/// A cluster event derived from one server's status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MonitorEvent {
    MasterDown = 1 << 0,
    MasterUp = 1 << 1,
    SlaveDown = 1 << 2,
    SlaveUp = 1 << 3,
    ServerDown = 1 << 4,
    ServerUp = 1 << 5,
    SyncedDown = 1 << 6,
    SyncedUp = 1 << 7,
    NdbDown = 1 << 8,
    NdbUp = 1 << 9,
    LostMaster = 1 << 10,
    LostSlave = 1 << 11,
    LostSynced = 1 << 12,
    LostNdb = 1 << 13,
    NewMaster = 1 << 14,
    NewSlave = 1 << 15,
    NewSynced = 1 << 16,
    NewNdb = 1 << 17,
}

const ALL_EVENTS: &[(MonitorEvent, &str)] = &[
    (MonitorEvent::MasterDown, "master_down"),
    (MonitorEvent::MasterUp, "master_up"),
    (MonitorEvent::SlaveDown, "slave_down"),
    (MonitorEvent::SlaveUp, "slave_up"),
    (MonitorEvent::ServerDown, "server_down"),
    (MonitorEvent::ServerUp, "server_up"),
    (MonitorEvent::SyncedDown, "synced_down"),
    (MonitorEvent::SyncedUp, "synced_up"),
    (MonitorEvent::NdbDown, "ndb_down"),
    (MonitorEvent::NdbUp, "ndb_up"),
    (MonitorEvent::LostMaster, "lost_master"),
    (MonitorEvent::LostSlave, "lost_slave"),
    (MonitorEvent::LostSynced, "lost_synced"),
    (MonitorEvent::LostNdb, "lost_ndb"),
    (MonitorEvent::NewMaster, "new_master"),
    (MonitorEvent::NewSlave, "new_slave"),
    (MonitorEvent::NewSynced, "new_synced"),
    (MonitorEvent::NewNdb, "new_ndb"),
];

impl MonitorEvent {
    /// Stable name used in logs and the `events` configuration list.
    pub fn name(self) -> &'static str {
        ALL_EVENTS
            .iter()
            .find(|(ev, _)| *ev == self)
            .map(|(_, name)| *name)
            .unwrap_or("undefined_event")
    }

    /// Parse an event name from the configuration form.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_EVENTS
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(ev, _)| *ev)
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        ALL_EVENTS.iter().find(|(ev, _)| *ev as u32 == bits).map(|(ev, _)| *ev)
    }
}

/// Subscription mask over [`MonitorEvent`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct EventSet(u32);

impl EventSet {
    pub fn all() -> Self {
        Self(ALL_EVENTS.iter().fold(0, |acc, (ev, _)| acc | *ev as u32))
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, event: MonitorEvent) -> bool {
        self.0 & event as u32 != 0
    }

    pub fn insert(&mut self, event: MonitorEvent) {
        self.0 |= event as u32;
    }

    /// Names of the subscribed events, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        ALL_EVENTS
            .iter()
            .filter(|(ev, _)| self.contains(*ev))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse a list of event names; unknown names are rejected.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut set = Self::empty();
        for name in names {
            let name = name.as_ref().trim();
            match MonitorEvent::from_name(name) {
                Some(ev) => set.insert(ev),
                None => return Err(format!("unknown monitor event '{name}'")),
            }
        }
        Ok(set)
    }
}

impl Default for EventSet {
    fn default() -> Self {
        Self::all()
    }
}

impl TryFrom<Vec<String>> for EventSet {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        if names.is_empty() {
            Ok(Self::all())
        } else {
            Self::from_names(&names)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionKind {
    Up,
    Down,
    Loss,
    New,
}

/// Derive the event for an observable `(prev, curr)` transition.
///
/// The caller is expected to have filtered with
/// [`crate::status::status_changed`]; identical relevant bits yield `None`.
/// Role-loss and role-gain transitions without any role bit in the defining
/// word are discarded.
pub fn classify(prev: u64, curr: u64) -> Option<MonitorEvent> {
    let prev = prev & ServerStatus::RELEVANT_BITS;
    let curr = curr & ServerStatus::RELEVANT_BITS;

    if prev == curr {
        debug_assert!(false, "classify() called on an unchanged status");
        return None;
    }

    let kind = if prev & ServerStatus::RUNNING == 0 {
        TransitionKind::Up
    } else if curr & ServerStatus::RUNNING == 0 {
        TransitionKind::Down
    } else {
        let prev_role = prev & (ServerStatus::MASTER | ServerStatus::SLAVE);
        let curr_role = curr & (ServerStatus::MASTER | ServerStatus::SLAVE);

        if (prev_role == 0 || curr_role == 0 || prev_role == curr_role)
            && prev & ServerStatus::ROLE_BITS != 0
        {
            TransitionKind::Loss
        } else {
            TransitionKind::New
        }
    };

    // The defining word: present status for UP/NEW, previous for DOWN/LOSS.
    let word = match kind {
        TransitionKind::Up | TransitionKind::New => curr,
        TransitionKind::Down | TransitionKind::Loss => prev,
    };

    let pick = |master, slave, synced, ndb, fallback: Option<MonitorEvent>| {
        if word & ServerStatus::MASTER != 0 {
            Some(master)
        } else if word & ServerStatus::SLAVE != 0 {
            Some(slave)
        } else if word & ServerStatus::JOINED != 0 {
            Some(synced)
        } else if word & ServerStatus::NDB != 0 {
            Some(ndb)
        } else {
            fallback
        }
    };

    match kind {
        TransitionKind::Up => pick(
            MonitorEvent::MasterUp,
            MonitorEvent::SlaveUp,
            MonitorEvent::SyncedUp,
            MonitorEvent::NdbUp,
            Some(MonitorEvent::ServerUp),
        ),
        TransitionKind::Down => pick(
            MonitorEvent::MasterDown,
            MonitorEvent::SlaveDown,
            MonitorEvent::SyncedDown,
            MonitorEvent::NdbDown,
            Some(MonitorEvent::ServerDown),
        ),
        TransitionKind::Loss => pick(
            MonitorEvent::LostMaster,
            MonitorEvent::LostSlave,
            MonitorEvent::LostSynced,
            MonitorEvent::LostNdb,
            None,
        ),
        TransitionKind::New => pick(
            MonitorEvent::NewMaster,
            MonitorEvent::NewSlave,
            MonitorEvent::NewSynced,
            MonitorEvent::NewNdb,
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: u64 = ServerStatus::RUNNING;
    const MASTER: u64 = ServerStatus::MASTER;
    const SLAVE: u64 = ServerStatus::SLAVE;
    const JOINED: u64 = ServerStatus::JOINED;
    const NDB: u64 = ServerStatus::NDB;

    #[test]
    fn test_up_events() {
        assert_eq!(classify(0, RUNNING | MASTER), Some(MonitorEvent::MasterUp));
        assert_eq!(classify(0, RUNNING | SLAVE), Some(MonitorEvent::SlaveUp));
        assert_eq!(classify(0, RUNNING | JOINED), Some(MonitorEvent::SyncedUp));
        assert_eq!(classify(0, RUNNING | NDB), Some(MonitorEvent::NdbUp));
        assert_eq!(classify(0, RUNNING), Some(MonitorEvent::ServerUp));
    }

    #[test]
    fn test_down_events_use_previous_word() {
        assert_eq!(classify(RUNNING | MASTER, 0), Some(MonitorEvent::MasterDown));
        assert_eq!(classify(RUNNING | SLAVE, 0), Some(MonitorEvent::SlaveDown));
        assert_eq!(classify(RUNNING | JOINED, 0), Some(MonitorEvent::SyncedDown));
        assert_eq!(classify(RUNNING | NDB, 0), Some(MonitorEvent::NdbDown));
        assert_eq!(classify(RUNNING, 0), Some(MonitorEvent::ServerDown));
    }

    #[test]
    fn test_role_transition_is_new() {
        // Slave promoted to master: both sides have a role and they differ.
        assert_eq!(
            classify(RUNNING | SLAVE, RUNNING | MASTER),
            Some(MonitorEvent::NewMaster)
        );
        assert_eq!(
            classify(RUNNING | MASTER, RUNNING | SLAVE),
            Some(MonitorEvent::NewSlave)
        );
        assert_eq!(classify(RUNNING, RUNNING | SLAVE), Some(MonitorEvent::NewSlave));
    }

    #[test]
    fn test_role_loss() {
        assert_eq!(
            classify(RUNNING | MASTER, RUNNING),
            Some(MonitorEvent::LostMaster)
        );
        assert_eq!(
            classify(RUNNING | SLAVE, RUNNING),
            Some(MonitorEvent::LostSlave)
        );
        assert_eq!(
            classify(RUNNING | JOINED, RUNNING),
            Some(MonitorEvent::LostSynced)
        );
    }

    #[test]
    fn test_master_priority_over_other_roles() {
        assert_eq!(
            classify(0, RUNNING | MASTER | JOINED),
            Some(MonitorEvent::MasterUp)
        );
        assert_eq!(
            classify(RUNNING | SLAVE | NDB, 0),
            Some(MonitorEvent::SlaveDown)
        );
    }

    #[test]
    fn test_ndb_to_slave_counts_as_loss() {
        // The loss/new decision only weighs MASTER and SLAVE; a server that
        // held NDB but neither of those loses what it had.
        assert_eq!(
            classify(RUNNING | NDB, RUNNING | SLAVE),
            Some(MonitorEvent::LostNdb)
        );
    }

    #[test]
    fn test_new_without_role_bit_is_discarded() {
        // Both sides running, no role anywhere: the relevant bits changed
        // (maintenance flag) but there is nothing to name.
        assert_eq!(classify(RUNNING, RUNNING | ServerStatus::MAINT), None);
    }

    #[test]
    fn test_event_names_round_trip() {
        for (ev, name) in ALL_EVENTS {
            assert_eq!(ev.name(), *name);
            assert_eq!(MonitorEvent::from_name(name), Some(*ev));
        }
        assert_eq!(MonitorEvent::from_name("MASTER_UP"), Some(MonitorEvent::MasterUp));
        assert_eq!(MonitorEvent::from_name("bogus"), None);
    }

    #[test]
    fn test_event_set_parsing() {
        let set = EventSet::from_names(&["master_down", "master_up"]).unwrap();
        assert!(set.contains(MonitorEvent::MasterDown));
        assert!(set.contains(MonitorEvent::MasterUp));
        assert!(!set.contains(MonitorEvent::SlaveDown));

        assert!(EventSet::from_names(&["nope"]).is_err());
        assert!(EventSet::all().contains(MonitorEvent::NewNdb));
    }
}
