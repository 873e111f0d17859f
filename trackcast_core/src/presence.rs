//! Presence message ordering.
//!
//! Message ids have the form `connection_id:serial:index`. Two messages
//! are ordered by `(serial, index)`, except when a synthesized leave is
//! involved: then only the timestamps are comparable.

use std::collections::{HashMap, VecDeque};
use trackcast_env::PresenceMessage;

/// Departed members kept for stale replay detection; older ones are evicted.
pub const DEPARTED_MEMBER_CAPACITY: usize = 32;

struct MessageId {
    serial: i64,
    index: i64,
}

fn parse_message_id(id: &str) -> Option<MessageId> {
    let mut parts = id.split(':');
    let (_connection, serial, index) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some(MessageId {
        serial: serial.parse().ok()?,
        index: index.parse().ok()?,
    })
}

// A leave the transport emitted on behalf of another connection.
fn is_synthesized_leave(message: &PresenceMessage, other: &PresenceMessage) -> bool {
    message.action.is_departure() && message.connection_id != other.connection_id
}

/// Returns true if `a` supersedes `b`.
///
/// Fails closed: a malformed id on either side yields `false`.
pub fn is_newer_than(a: &PresenceMessage, b: &PresenceMessage) -> bool {
    let (Some(id_a), Some(id_b)) = (parse_message_id(&a.id), parse_message_id(&b.id)) else {
        return false;
    };

    if is_synthesized_leave(a, b) || is_synthesized_leave(b, a) {
        return a.timestamp > b.timestamp;
    }

    (id_a.serial, id_a.index) > (id_b.serial, id_b.index)
}

/// Last accepted presence message per member of one channel.
///
/// Present members are kept until they depart. Departed members stay only
/// while they are among the last [`DEPARTED_MEMBER_CAPACITY`] departures.
#[derive(Debug, Default)]
pub struct PresenceMembers {
    members: HashMap<String, PresenceMessage>,
    departed: VecDeque<String>,
}

impl PresenceMembers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the message if it is the first for its member or newer than
    /// the stored one. Returns whether it was accepted.
    pub fn accept(&mut self, message: &PresenceMessage) -> bool {
        let newer = self
            .members
            .get(&message.member_key)
            .map_or(true, |existing| is_newer_than(message, existing));
        if !newer {
            return false;
        }

        let key = &message.member_key;
        self.departed.retain(|departed| departed != key);
        self.members.insert(key.clone(), message.clone());
        if message.action.is_departure() {
            self.departed.push_back(key.clone());
            while self.departed.len() > DEPARTED_MEMBER_CAPACITY {
                if let Some(oldest) = self.departed.pop_front() {
                    self.members.remove(&oldest);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use trackcast_env::{PresenceAction, PresenceData};

    fn message(action: PresenceAction, connection_id: &str, id: &str, timestamp: i64) -> PresenceMessage {
        PresenceMessage {
            action,
            data: PresenceData::subscriber(None),
            member_key: "client:conn".to_string(),
            connection_id: connection_id.to_string(),
            client_id: "client".to_string(),
            id: id.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_higher_serial_is_newer() {
        let a = message(PresenceAction::Update, "abc", "abc:3:0", 100);
        let b = message(PresenceAction::Update, "abc", "abc:2:9", 200);
        assert!(is_newer_than(&a, &b));
        assert!(!is_newer_than(&b, &a));
    }

    #[test]
    fn test_equal_serial_compares_index() {
        let a = message(PresenceAction::Leave, "abc", "abc:2:4", 100);
        let b = message(PresenceAction::Leave, "abc", "abc:2:3", 123);
        assert!(is_newer_than(&a, &b));
    }

    #[test]
    fn test_synthesized_leave_compares_timestamps() {
        let a = message(PresenceAction::Leave, "abd", "abc:0:1", 123);
        let b = message(PresenceAction::Leave, "abc", "abc:0:1", 100);
        assert!(is_newer_than(&a, &b));
        assert!(!is_newer_than(&b, &a));

        let older = message(PresenceAction::Leave, "abd", "abc:9:9", 50);
        assert!(!is_newer_than(&older, &b));
    }

    #[test]
    fn test_malformed_ids_fail_closed() {
        let good = message(PresenceAction::Enter, "abc", "abc:1:1", 0);
        for bad in ["abc:1", "abc:x:1", "abc:1:y", "abc:1:1:1", ""] {
            let malformed = message(PresenceAction::Enter, "abc", bad, i64::MAX);
            assert!(!is_newer_than(&malformed, &good), "{bad}");
            assert!(!is_newer_than(&good, &malformed), "{bad}");
        }
    }

    #[test]
    fn test_members_ignore_stale_messages() {
        let mut members = PresenceMembers::new();
        assert!(members.accept(&message(PresenceAction::Enter, "abc", "abc:5:0", 0)));
        assert!(!members.accept(&message(PresenceAction::Update, "abc", "abc:4:0", 0)));
        assert!(members.accept(&message(PresenceAction::Leave, "abc", "abc:6:0", 0)));
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn test_departed_members_are_evicted_oldest_first() {
        let mut members = PresenceMembers::new();
        let member = |n: usize, action: PresenceAction, serial: i64| PresenceMessage {
            member_key: format!("client-{n}:conn-{n}"),
            ..message(action, &format!("conn-{n}"), &format!("conn-{n}:{serial}:0"), serial)
        };

        assert!(members.accept(&member(0, PresenceAction::Enter, 1)));
        for n in 1..=100 {
            assert!(members.accept(&member(n, PresenceAction::Enter, 1)));
            assert!(members.accept(&member(n, PresenceAction::Leave, 2)));
        }
        // Member 0 is still present
        assert_eq!(members.len(), DEPARTED_MEMBER_CAPACITY + 1);

        // A recent departure still rejects a replayed enter
        assert!(!members.accept(&member(100, PresenceAction::Enter, 1)));

        // Re-entering removes a member from the departed set
        assert!(members.accept(&member(99, PresenceAction::Enter, 3)));
        assert_eq!(members.len(), DEPARTED_MEMBER_CAPACITY + 1);
    }

    proptest! {
        #[test]
        fn test_well_formed_ids_are_totally_ordered(
            s1 in 0i64..1000, i1 in 0i64..1000,
            s2 in 0i64..1000, i2 in 0i64..1000,
            t1 in any::<i64>(), t2 in any::<i64>(),
        ) {
            let a = message(PresenceAction::Update, "c", &format!("c:{s1}:{i1}"), t1);
            let b = message(PresenceAction::Update, "c", &format!("c:{s2}:{i2}"), t2);
            let expected = (s1, i1) > (s2, i2);
            prop_assert_eq!(is_newer_than(&a, &b), expected);
            if (s1, i1) != (s2, i2) {
                prop_assert!(is_newer_than(&a, &b) ^ is_newer_than(&b, &a));
            } else {
                prop_assert!(!is_newer_than(&a, &b) && !is_newer_than(&b, &a));
            }
        }

        #[test]
        fn test_malformed_serial_never_newer(serial in "[a-z]{1,4}", t in any::<i64>()) {
            let a = message(PresenceAction::Update, "c", &format!("c:{serial}:1"), t);
            let b = message(PresenceAction::Update, "c", "c:1:1", i64::MIN);
            prop_assert!(!is_newer_than(&a, &b));
        }
    }
}
