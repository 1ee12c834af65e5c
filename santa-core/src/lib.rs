use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type UserId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub wishlist: Option<String>,
    pub address: Option<String>,
    pub is_creator: bool,
}

impl Participant {
    pub fn is_ready(&self) -> bool {
        let filled = |field: &Option<String>| {
            field.as_deref().map(str::trim).is_some_and(|v| !v.is_empty())
        };
        filled(&self.wishlist) && filled(&self.address)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    None,
    Collecting,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pairing {
    pub giver: UserId,
    pub receiver: UserId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToGiftee,
    ToGifter,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("an exchange is already running")]
    AlreadyActive,
    #[error("no exchange is collecting participants")]
    NotCollecting,
    #[error("only the organizer can do that")]
    Unauthorized,
    #[error("at least two participants are required")]
    InsufficientParticipants,
    #[error("some participants are missing a wishlist or address")]
    IncompleteInfo { missing: Vec<UserId> },
    #[error("no exchange is running")]
    NoActiveEvent,
    #[error("you have already joined")]
    AlreadyJoined,
    #[error("you are not a participant")]
    NotAParticipant,
    #[error("failed to draw a valid pairing")]
    PairingFailed,
    #[error("no partner assigned yet")]
    NoAssignment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub phase: Phase,
    pub creator: Option<UserId>,
    pub participants: Vec<Participant>,
    pub pairings: Vec<Pairing>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            phase: Phase::None,
            creator: None,
            participants: Vec::new(),
            pairings: Vec::new(),
        }
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, creator: impl Into<UserId>) -> Result<(), ExchangeError> {
        if !matches!(self.phase, Phase::None) {
            return Err(ExchangeError::AlreadyActive);
        }
        self.participants.clear();
        self.pairings.clear();
        self.creator = Some(creator.into());
        self.phase = Phase::Collecting;
        Ok(())
    }

    pub fn join(
        &mut self,
        user_id: impl Into<UserId>,
        name: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        if !matches!(self.phase, Phase::Collecting) {
            return Err(ExchangeError::NotCollecting);
        }
        let user_id = user_id.into();
        if self.participants.iter().any(|p| p.id == user_id) {
            return Err(ExchangeError::AlreadyJoined);
        }
        let is_creator = self.creator.as_deref() == Some(user_id.as_str());
        self.participants.push(Participant {
            id: user_id,
            name: name.into(),
            wishlist: None,
            address: None,
            is_creator,
        });
        Ok(())
    }

    pub fn set_wishlist(
        &mut self,
        user_id: &str,
        text: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        let participant = self
            .participant_mut(user_id)
            .ok_or(ExchangeError::NotAParticipant)?;
        participant.wishlist = Some(text.into());
        Ok(())
    }

    pub fn set_address(
        &mut self,
        user_id: &str,
        text: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        let participant = self
            .participant_mut(user_id)
            .ok_or(ExchangeError::NotAParticipant)?;
        participant.address = Some(text.into());
        Ok(())
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user_id)
    }

    fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == user_id)
    }

    // Join order, display only.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn missing_info(&self) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| !p.is_ready())
            .map(|p| p.id.clone())
            .collect()
    }

    fn authorize(&self, requester: &str, is_admin: bool) -> Result<(), ExchangeError> {
        if is_admin || self.creator.as_deref() == Some(requester) {
            Ok(())
        } else {
            Err(ExchangeError::Unauthorized)
        }
    }

    pub fn start<R: Rng>(
        &mut self,
        requester: &str,
        is_admin: bool,
        rng: &mut R,
    ) -> Result<(), ExchangeError> {
        self.authorize(requester, is_admin)?;
        if !matches!(self.phase, Phase::Collecting) {
            return Err(ExchangeError::NotCollecting);
        }
        if self.participants.len() < 2 {
            return Err(ExchangeError::InsufficientParticipants);
        }
        let missing = self.missing_info();
        if !missing.is_empty() {
            return Err(ExchangeError::IncompleteInfo { missing });
        }

        let ids: Vec<UserId> = self.participants.iter().map(|p| p.id.clone()).collect();
        let pairings = assign_pairs(&ids, rng)?;

        // Pairings and phase change together or not at all.
        self.pairings = pairings;
        self.phase = Phase::Active;
        Ok(())
    }

    pub fn cancel(&mut self, requester: &str, is_admin: bool) -> Result<(), ExchangeError> {
        self.authorize(requester, is_admin)?;
        if matches!(self.phase, Phase::None) {
            return Err(ExchangeError::NoActiveEvent);
        }
        *self = Self::default();
        Ok(())
    }

    pub fn remind(&self, requester: &str, is_admin: bool) -> Result<Vec<UserId>, ExchangeError> {
        self.authorize(requester, is_admin)?;
        if matches!(self.phase, Phase::None) {
            return Err(ExchangeError::NoActiveEvent);
        }
        Ok(self.missing_info())
    }

    pub fn giftee_of(&self, user_id: &str) -> Result<&Participant, ExchangeError> {
        if !matches!(self.phase, Phase::Active) {
            return Err(ExchangeError::NoAssignment);
        }
        let pairing = self
            .pairings
            .iter()
            .find(|p| p.giver == user_id)
            .ok_or(ExchangeError::NoAssignment)?;
        self.participant(&pairing.receiver)
            .ok_or(ExchangeError::NoAssignment)
    }

    pub fn gifter_of(&self, user_id: &str) -> Result<&Participant, ExchangeError> {
        if !matches!(self.phase, Phase::Active) {
            return Err(ExchangeError::NoAssignment);
        }
        let pairing = self
            .pairings
            .iter()
            .find(|p| p.receiver == user_id)
            .ok_or(ExchangeError::NoAssignment)?;
        self.participant(&pairing.giver)
            .ok_or(ExchangeError::NoAssignment)
    }

    // The returned tuple is all the delivery layer gets to see; the sender's
    // identity never leaves this call.
    pub fn relay(
        &self,
        from: &str,
        direction: Direction,
        text: impl Into<String>,
    ) -> Result<(UserId, String), ExchangeError> {
        let counterpart = match direction {
            Direction::ToGiftee => self.giftee_of(from)?,
            Direction::ToGifter => self.gifter_of(from)?,
        };
        Ok((counterpart.id.clone(), text.into()))
    }
}

const MAX_DRAW_ATTEMPTS: usize = 1000;

pub fn assign_pairs<R: Rng>(ids: &[UserId], rng: &mut R) -> Result<Vec<Pairing>, ExchangeError> {
    if ids.len() < 2 {
        return Err(ExchangeError::InsufficientParticipants);
    }
    let mut receivers: Vec<UserId> = ids.to_vec();
    for _ in 0..MAX_DRAW_ATTEMPTS {
        receivers.shuffle(rng);
        // Accept only a draw where nobody gifts themself.
        if ids.iter().zip(receivers.iter()).all(|(g, r)| g != r) {
            return Ok(ids
                .iter()
                .zip(receivers.iter())
                .map(|(giver, receiver)| Pairing {
                    giver: giver.clone(),
                    receiver: receiver.clone(),
                })
                .collect());
        }
    }
    Err(ExchangeError::PairingFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn collecting(ids: &[&str]) -> Exchange {
        let mut ex = Exchange::new();
        ex.create(ids[0]).unwrap();
        for id in ids {
            ex.join(*id, format!("name-{id}")).unwrap();
        }
        ex
    }

    fn ready(ids: &[&str]) -> Exchange {
        let mut ex = collecting(ids);
        for id in ids {
            ex.set_wishlist(id, format!("wishlist-{id}")).unwrap();
            ex.set_address(id, format!("address-{id}")).unwrap();
        }
        ex
    }

    fn assert_derangement(ids: &[&str], pairings: &[Pairing]) {
        assert_eq!(pairings.len(), ids.len());
        let givers: HashSet<&str> = pairings.iter().map(|p| p.giver.as_str()).collect();
        let receivers: HashSet<&str> = pairings.iter().map(|p| p.receiver.as_str()).collect();
        let expected: HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(givers, expected);
        assert_eq!(receivers, expected);
        for pairing in pairings {
            assert_ne!(pairing.giver, pairing.receiver);
        }
    }

    #[test]
    fn create_opens_collection() {
        let mut ex = Exchange::new();
        ex.create("alice").unwrap();
        assert_eq!(ex.phase, Phase::Collecting);
        assert_eq!(ex.creator.as_deref(), Some("alice"));
        assert!(ex.participants.is_empty());
        assert!(ex.pairings.is_empty());
    }

    #[test]
    fn create_rejected_while_running() {
        let mut ex = collecting(&["alice"]);
        assert_eq!(ex.create("bob").unwrap_err(), ExchangeError::AlreadyActive);

        let mut ex = ready(&["alice", "bob"]);
        ex.start("alice", false, &mut rng()).unwrap();
        assert_eq!(ex.create("bob").unwrap_err(), ExchangeError::AlreadyActive);
    }

    #[test]
    fn join_requires_collecting() {
        let mut ex = Exchange::new();
        assert_eq!(
            ex.join("alice", "alice").unwrap_err(),
            ExchangeError::NotCollecting
        );

        let mut ex = ready(&["alice", "bob"]);
        ex.start("alice", false, &mut rng()).unwrap();
        assert_eq!(
            ex.join("carol", "carol").unwrap_err(),
            ExchangeError::NotCollecting
        );
    }

    #[test]
    fn duplicate_join_rejected() {
        let mut ex = collecting(&["alice"]);
        assert_eq!(
            ex.join("alice", "alice again").unwrap_err(),
            ExchangeError::AlreadyJoined
        );
        assert_eq!(ex.participants.len(), 1);
    }

    #[test]
    fn join_marks_the_organizer() {
        let ex = collecting(&["alice", "bob"]);
        assert!(ex.participant("alice").unwrap().is_creator);
        assert!(!ex.participant("bob").unwrap().is_creator);
    }

    #[test]
    fn info_requires_membership() {
        let mut ex = collecting(&["alice"]);
        assert_eq!(
            ex.set_wishlist("ghost", "socks").unwrap_err(),
            ExchangeError::NotAParticipant
        );
        assert_eq!(
            ex.set_address("ghost", "north pole").unwrap_err(),
            ExchangeError::NotAParticipant
        );
    }

    #[test]
    fn info_updates_allowed_after_start() {
        let mut ex = ready(&["alice", "bob"]);
        ex.start("alice", false, &mut rng()).unwrap();
        ex.set_wishlist("bob", "a newer wish").unwrap();
        assert_eq!(
            ex.participant("bob").unwrap().wishlist.as_deref(),
            Some("a newer wish")
        );
    }

    #[test]
    fn start_requires_organizer_or_admin() {
        let mut ex = ready(&["alice", "bob"]);
        assert_eq!(
            ex.start("bob", false, &mut rng()).unwrap_err(),
            ExchangeError::Unauthorized
        );
        assert_eq!(ex.phase, Phase::Collecting);
        ex.start("bob", true, &mut rng()).unwrap();
        assert_eq!(ex.phase, Phase::Active);
    }

    #[test]
    fn start_needs_two_participants() {
        let mut ex = collecting(&["alice"]);
        ex.set_wishlist("alice", "socks").unwrap();
        ex.set_address("alice", "north pole").unwrap();
        assert_eq!(
            ex.start("alice", false, &mut rng()).unwrap_err(),
            ExchangeError::InsufficientParticipants
        );
    }

    #[test]
    fn start_reports_exactly_the_missing_participants() {
        let mut ex = ready(&["alice", "bob", "carol"]);
        ex.join("dave", "dave").unwrap();
        ex.set_wishlist("dave", "a train set").unwrap();

        let err = ex.start("alice", false, &mut rng()).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::IncompleteInfo {
                missing: vec!["dave".to_string()]
            }
        );
        assert_eq!(ex.phase, Phase::Collecting);
        assert!(ex.pairings.is_empty());
    }

    #[test]
    fn blank_info_counts_as_missing() {
        let mut ex = ready(&["alice", "bob"]);
        ex.set_wishlist("bob", "   ").unwrap();
        let err = ex.start("alice", false, &mut rng()).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::IncompleteInfo {
                missing: vec!["bob".to_string()]
            }
        );
    }

    #[test]
    fn start_draws_a_derangement() {
        let ids = ["alice", "bob", "carol"];
        let mut ex = ready(&ids);
        ex.start("alice", false, &mut rng()).unwrap();
        assert_eq!(ex.phase, Phase::Active);
        assert_derangement(&ids, &ex.pairings);
    }

    #[test]
    fn derangement_holds_for_small_rosters() {
        for n in 2..=8 {
            let owned: Vec<UserId> = (0..n).map(|i| format!("user-{i}")).collect();
            let ids: Vec<&str> = owned.iter().map(String::as_str).collect();
            for seed in 0..20 {
                let mut rng = StdRng::seed_from_u64(seed);
                let pairings = assign_pairs(&owned, &mut rng).unwrap();
                assert_derangement(&ids, &pairings);
            }
        }
    }

    #[test]
    fn two_participants_always_swap() {
        let ids = vec!["alice".to_string(), "bob".to_string()];
        let pairings = assign_pairs(&ids, &mut rng()).unwrap();
        assert_eq!(pairings[0].giver, "alice");
        assert_eq!(pairings[0].receiver, "bob");
        assert_eq!(pairings[1].giver, "bob");
        assert_eq!(pairings[1].receiver, "alice");
    }

    #[test]
    fn pairing_needs_at_least_two() {
        let ids = vec!["alice".to_string()];
        assert_eq!(
            assign_pairs(&ids, &mut rng()).unwrap_err(),
            ExchangeError::InsufficientParticipants
        );
    }

    #[test]
    fn cancel_resets_everything() {
        let mut ex = ready(&["alice", "bob"]);
        ex.start("alice", false, &mut rng()).unwrap();
        ex.cancel("alice", false).unwrap();
        assert_eq!(ex.phase, Phase::None);
        assert!(ex.participants.is_empty());
        assert!(ex.pairings.is_empty());
        assert!(ex.creator.is_none());

        // A fresh event starts from a clean slate.
        ex.create("bob").unwrap();
        assert!(ex.participants.is_empty());
        assert!(ex.pairings.is_empty());
    }

    #[test]
    fn cancel_requires_authorization_and_an_event() {
        let mut ex = collecting(&["alice", "bob"]);
        assert_eq!(
            ex.cancel("bob", false).unwrap_err(),
            ExchangeError::Unauthorized
        );
        ex.cancel("bob", true).unwrap();
        assert_eq!(
            ex.cancel("anyone", true).unwrap_err(),
            ExchangeError::NoActiveEvent
        );
    }

    #[test]
    fn giftee_and_gifter_are_mutual_inverses() {
        let ids = ["alice", "bob", "carol", "dave"];
        let mut ex = ready(&ids);
        ex.start("alice", false, &mut rng()).unwrap();
        for id in ids {
            let giftee = ex.giftee_of(id).unwrap().id.clone();
            assert_eq!(ex.gifter_of(&giftee).unwrap().id, id);
        }
    }

    #[test]
    fn relay_routes_without_exposing_the_sender() {
        let mut ex = ready(&["alice", "bob"]);
        ex.start("alice", false, &mut rng()).unwrap();

        let (recipient, text) = ex.relay("alice", Direction::ToGiftee, "ho ho ho").unwrap();
        assert_eq!(recipient, "bob");
        assert_eq!(text, "ho ho ho");

        let (recipient, text) = ex.relay("alice", Direction::ToGifter, "thanks!").unwrap();
        assert_eq!(recipient, "bob");
        assert_eq!(text, "thanks!");
    }

    #[test]
    fn relay_before_start_is_rejected() {
        let ex = collecting(&["alice", "bob"]);
        assert_eq!(
            ex.relay("alice", Direction::ToGiftee, "hello").unwrap_err(),
            ExchangeError::NoAssignment
        );
        assert_eq!(
            ex.giftee_of("alice").unwrap_err(),
            ExchangeError::NoAssignment
        );
    }

    #[test]
    fn remind_lists_incomplete_participants() {
        let mut ex = ready(&["alice", "bob"]);
        ex.join("carol", "carol").unwrap();
        assert_eq!(
            ex.remind("alice", false).unwrap(),
            vec!["carol".to_string()]
        );
        assert_eq!(
            ex.remind("carol", false).unwrap_err(),
            ExchangeError::Unauthorized
        );

        let ex = Exchange::new();
        assert_eq!(
            ex.remind("anyone", true).unwrap_err(),
            ExchangeError::NoActiveEvent
        );
    }
}
