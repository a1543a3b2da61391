//! Property-based tests for Coplay
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Admission Properties
// ============================================================================

mod admission_properties {
    use super::*;
    use coplay_core::admission::{Admission, JoinFilter, decide, decide_in_lobby};
    use coplay_core::LobbyId;
    use coplay_transport::{EndReason, PeerIdentity};

    fn filter_strategy() -> impl Strategy<Value = JoinFilter> {
        prop_oneof![
            Just(JoinFilter::Off),
            Just(JoinFilter::Controlled),
            Just(JoinFilter::FriendsOnly),
            Just(JoinFilter::Everyone),
        ]
    }

    proptest! {
        /// The decision depends only on the filter and friendship
        #[test]
        fn decision_is_pure(
            filter in filter_strategy(),
            raw in 1u64..,
            friend in any::<bool>(),
        ) {
            let peer = PeerIdentity::new(raw);
            let lookup = move |_: PeerIdentity| friend;
            let first = decide(filter, peer, &lookup);
            prop_assert_eq!(decide(filter, peer, &lookup), first);

            let expected = match (filter, friend) {
                (JoinFilter::Off, _) => Admission::Reject(EndReason::NotOpen),
                (JoinFilter::Everyone, _) => Admission::Accept,
                (JoinFilter::FriendsOnly, true) => Admission::Accept,
                (JoinFilter::FriendsOnly, false) => Admission::Reject(EndReason::NotFriend),
                (JoinFilter::Controlled, _) => Admission::RequirePassword,
            };
            prop_assert_eq!(first, expected);
        }

        /// Controlled never consults the friend list
        #[test]
        fn controlled_ignores_friendship(raw in 1u64.., friend in any::<bool>()) {
            let lookup = move |_: PeerIdentity| friend;
            prop_assert_eq!(
                decide(JoinFilter::Controlled, PeerIdentity::new(raw), &lookup),
                Admission::RequirePassword
            );
        }

        /// Lobby admission accepts exactly the members of an existing lobby
        #[test]
        fn lobby_admission(lobby in proptest::option::of(any::<u64>()), member in any::<bool>()) {
            let decision = decide_in_lobby(lobby.map(LobbyId::new), member);
            if lobby.is_some() && member {
                prop_assert_eq!(decision, Admission::Accept);
            } else {
                prop_assert_eq!(decision, Admission::Reject(EndReason::NotOpen));
            }
        }

        /// Filter names parse back to the same filter
        #[test]
        fn filter_display_parses(filter in filter_strategy()) {
            let parsed: JoinFilter = filter.to_string().parse().expect("display form parses");
            prop_assert_eq!(parsed, filter);
        }
    }
}

// ============================================================================
// Passcode Properties
// ============================================================================

mod passcode_properties {
    use super::*;
    use coplay_core::Passcode;
    use coplay_core::passcode::PASSCODE_LEN;

    proptest! {
        /// Generated passcodes are fixed-length ASCII alphanumerics
        #[test]
        fn generated_shape(_round in 0u8..32) {
            let code = Passcode::generate();
            prop_assert_eq!(code.as_str().len(), PASSCODE_LEN);
            prop_assert!(code.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
        }

        /// Matching is exact and case-sensitive
        #[test]
        fn matches_only_itself(
            value in "[A-Za-z0-9]{1,40}",
            other in proptest::collection::vec(any::<u8>(), 0..48),
        ) {
            let code = Passcode::new(value.clone());
            prop_assert!(code.matches(value.as_bytes()));
            prop_assert_eq!(code.matches(&other), other == value.as_bytes());

            let swapped: String = value
                .chars()
                .map(|c| {
                    if c.is_ascii_lowercase() {
                        c.to_ascii_uppercase()
                    } else {
                        c.to_ascii_lowercase()
                    }
                })
                .collect();
            if swapped != value {
                prop_assert!(!code.matches(swapped.as_bytes()));
            }
        }

        /// A prefix or extension of the passcode never matches
        #[test]
        fn length_must_match(value in "[A-Za-z0-9]{2,40}", extra in "[A-Za-z0-9]{1,4}") {
            let code = Passcode::new(value.clone());
            prop_assert!(!code.matches(&value.as_bytes()[..value.len() - 1]));
            let extended = format!("{value}{extra}");
            prop_assert!(!code.matches(extended.as_bytes()));
        }
    }
}

// ============================================================================
// Join Command Properties
// ============================================================================

mod join_command_properties {
    use super::*;
    use coplay_core::{JoinCommand, JoinTarget, LobbyId};
    use coplay_transport::PeerIdentity;

    proptest! {
        /// Host commands parse back to the same target and passcode
        #[test]
        fn peer_command_parses(
            raw in 1u64..,
            password in proptest::option::of("[A-Za-z0-9]{1,32}"),
        ) {
            let command = JoinCommand::peer(PeerIdentity::new(raw), password.as_deref());
            let parsed = JoinCommand::parse(&command.to_string()).expect("canonical form parses");
            prop_assert_eq!(parsed.target, JoinTarget::Peer(PeerIdentity::new(raw)));
            prop_assert_eq!(parsed.password, password);
        }

        /// Lobby commands parse back to the same lobby
        #[test]
        fn lobby_command_parses(raw in any::<u64>()) {
            let command = JoinCommand::lobby(LobbyId::new(raw));
            let parsed = JoinCommand::parse(&command.to_string()).expect("canonical form parses");
            prop_assert_eq!(parsed, command);
        }

        /// Presence strings carrying forbidden characters are always refused
        #[test]
        fn presence_refuses_forbidden(
            raw in 1u64..,
            before in "[A-Za-z0-9]{0,8}",
            bad in prop_oneof![Just('\''), Just('"'), Just('\\'), Just('/'), Just(';')],
            after in "[A-Za-z0-9]{0,8}",
        ) {
            let connect = format!("+coplay_connect {raw} {before}{bad}{after}");
            prop_assert!(JoinCommand::from_presence(&connect).is_err());
        }

        /// Presence strings without the leading '+' are refused
        #[test]
        fn presence_requires_plus(raw in 1u64..) {
            let connect = format!("coplay_connect {raw}");
            prop_assert!(JoinCommand::from_presence(&connect).is_err());
            let prefixed = format!("+{connect}");
            prop_assert!(JoinCommand::from_presence(&prefixed).is_ok());
        }

        /// Arbitrary input never panics the parser
        #[test]
        fn parse_never_panics(input in ".{0,64}") {
            let _ = JoinCommand::parse(&input);
            let _ = JoinCommand::from_presence(&input);
        }
    }
}

// ============================================================================
// Handshake Properties
// ============================================================================

mod handshake_properties {
    use super::*;
    use coplay_core::Passcode;
    use coplay_core::handshake::{ClientHandshake, HandshakeStep, NEED_PASSWORD, OK};

    proptest! {
        /// Game traffic before OK never completes the handshake
        #[test]
        fn game_traffic_is_not_a_token(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assume!(payload != OK && payload != NEED_PASSWORD);
            prop_assume!(payload.strip_suffix(&[0]).is_none_or(|p| p != OK && p != NEED_PASSWORD));

            let mut handshake = ClientHandshake::awaiting(Some(Passcode::new("secret")));
            prop_assert_eq!(handshake.on_message(&payload), HandshakeStep::Ignored);
            prop_assert!(!handshake.is_ready());
        }

        /// The password is offered at most once however often it is asked for
        #[test]
        fn password_sent_once(asks in 1usize..8, value in "[A-Za-z0-9]{1,32}") {
            let mut handshake = ClientHandshake::awaiting(Some(Passcode::new(value.clone())));
            let replies = (0..asks)
                .filter(|_| matches!(handshake.on_message(NEED_PASSWORD), HandshakeStep::Reply(_)))
                .count();
            prop_assert_eq!(replies, 1);
            prop_assert_eq!(handshake.on_message(OK), HandshakeStep::Ready);
        }
    }
}

// ============================================================================
// Port Range Properties
// ============================================================================

mod port_range_properties {
    use super::*;
    use coplay_transport::PortRange;

    proptest! {
        /// Valid ranges contain exactly their inclusive bounds
        #[test]
        fn contains_matches_bounds(
            start in 1u16..60000,
            span in 0u16..2000,
            port in any::<u16>(),
        ) {
            let end = start.saturating_add(span);
            let range = PortRange::new(start, end).expect("valid range");
            prop_assert_eq!(range.contains(port), port >= start && port <= end);
            prop_assert_eq!(range.len(), usize::from(end - start) + 1);
            prop_assert_eq!(range.iter().count(), range.len());
            prop_assert!(!range.is_empty());
        }

        /// Inverted ranges and port 0 are refused
        #[test]
        fn invalid_ranges_refused(start in 2u16.., below in 1u16..) {
            prop_assume!(below < start);
            prop_assert!(PortRange::new(start, below).is_err());
            prop_assert!(PortRange::new(0, start).is_err());
        }
    }
}
