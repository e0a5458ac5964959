use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinboard_db::{Store, WriteFailure, classify};
use pinboard_types::SyncError;
use pinboard_types::api::NewVote;
use pinboard_types::models::{ChatMessage, MessageKind, RadiusBucket, Vote};

use crate::debounce::Debouncer;
use crate::error::{Result, from_store};
use crate::reconciler::Reconciler;

/// Vote count for one bucket of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketTally {
    pub bucket: RadiusBucket,
    pub count: usize,
    /// The asking user's vote is in this bucket.
    pub user_voted: bool,
}

/// A radius the write-back will apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiusUpdate {
    pub message_id: Uuid,
    pub pin_id: Uuid,
    pub radius_meters: u32,
}

/// Votes for `message_id`, at most one per voter (the first one seen).
fn votes_for<'a>(votes: impl IntoIterator<Item = &'a Vote>, message_id: Uuid) -> Vec<&'a Vote> {
    let mut voters = HashSet::new();
    votes
        .into_iter()
        .filter(|v| v.message_id == message_id && voters.insert(v.voter_id))
        .collect()
}

fn counts(votes: &[&Vote]) -> [usize; 6] {
    let mut counts = [0usize; 6];
    for vote in votes {
        if let Some(i) = RadiusBucket::ALL.iter().position(|b| *b == vote.bucket) {
            counts[i] += 1;
        }
    }
    counts
}

/// Per-bucket counts for a message, in fixed bucket order.
pub fn tally<'a>(votes: impl IntoIterator<Item = &'a Vote>, message_id: Uuid, asking_user: Uuid) -> Vec<BucketTally> {
    let relevant = votes_for(votes, message_id);
    let own = relevant.iter().find(|v| v.voter_id == asking_user).map(|v| v.bucket);
    let counts = counts(&relevant);

    RadiusBucket::ALL
        .iter()
        .zip(counts)
        .map(|(&bucket, count)| BucketTally {
            bucket,
            count,
            user_voted: own == Some(bucket),
        })
        .collect()
}

/// Bucket with the most votes. Ties go to the bucket that comes first in
/// the fixed order. `None` without votes.
pub fn plurality<'a>(votes: impl IntoIterator<Item = &'a Vote>, message_id: Uuid) -> Option<RadiusBucket> {
    let counts = counts(&votes_for(votes, message_id));

    let mut winner: Option<(RadiusBucket, usize)> = None;
    for (&bucket, count) in RadiusBucket::ALL.iter().zip(counts) {
        if count > winner.map_or(0, |(_, best)| best) {
            winner = Some((bucket, count));
        }
    }
    winner.map(|(bucket, _)| bucket)
}

/// Radius the message's votes resolve to: the winning bucket's midpoint.
pub fn resolve_radius<'a>(votes: impl IntoIterator<Item = &'a Vote>, message_id: Uuid) -> Option<u32> {
    plurality(votes, message_id).map(|b| b.midpoint())
}

pub fn has_voted(votes: &Reconciler<Vote>, voter_id: Uuid, message_id: Uuid) -> bool {
    votes
        .iter()
        .any(|v| v.voter_id == voter_id && v.message_id == message_id)
}

/// Radii for every pin announced in `messages` that has at least one vote.
pub fn radius_plan<'a>(
    messages: impl IntoIterator<Item = &'a ChatMessage>,
    votes: &[&Vote],
) -> Vec<RadiusUpdate> {
    messages
        .into_iter()
        .filter(|m| m.kind == MessageKind::PinNotification)
        .filter_map(|m| {
            let pin_id = m.related_pin_id?;
            let radius_meters = resolve_radius(votes.iter().copied(), m.id)?;
            Some(RadiusUpdate {
                message_id: m.id,
                pin_id,
                radius_meters,
            })
        })
        .collect()
}

/// Write a resolved radius to the pin. Writing the value the pin already has
/// is a no-op; returns whether anything changed.
pub async fn apply_radius(store: &Store, pin_id: Uuid, radius_meters: u32) -> Result<bool> {
    store
        .update_pin_radius(pin_id, radius_meters)
        .await
        .map_err(from_store)
}

/// Casts votes and keeps pin radii in line with the plurality.
pub struct VoteConsensus {
    store: Store,
    write_back: Debouncer,
}

impl VoteConsensus {
    pub fn new(store: Store, quiet_period: Duration) -> Self {
        Self {
            store,
            write_back: Debouncer::new(quiet_period),
        }
    }

    /// Cast a vote with an optimistic entry in `votes`.
    ///
    /// Fails with `AlreadyVoted` if the local collection already has a vote
    /// by this user for this message, or if the store's uniqueness
    /// constraint rejects the write because another client got there first.
    /// Any failed write is rolled back.
    pub async fn cast_vote(
        &self,
        votes: &mut Reconciler<Vote>,
        voter_id: Uuid,
        message_id: Uuid,
        bucket: RadiusBucket,
    ) -> Result<Vote> {
        if has_voted(votes, voter_id, message_id) {
            debug!("{} already voted on {}, ignoring", voter_id, message_id);
            return Err(SyncError::AlreadyVoted { voter_id, message_id });
        }

        let temp_id = Uuid::new_v4();
        votes.apply_optimistic(
            temp_id,
            Vote {
                id: temp_id,
                voter_id,
                message_id,
                bucket,
                created_at: Utc::now(),
            },
        );

        let written = self
            .store
            .insert_vote(NewVote {
                voter_id,
                message_id,
                bucket,
            })
            .await;

        match written {
            Ok(vote) => {
                votes.reconcile_optimistic(temp_id, vote.id, vote.clone());
                info!("{} voted {} on {}", voter_id, bucket, message_id);
                Ok(vote)
            }
            Err(err) => {
                votes.rollback_optimistic(temp_id);
                if classify(&err) == WriteFailure::Duplicate {
                    info!("{} lost a concurrent vote on {}", voter_id, message_id);
                    Err(SyncError::AlreadyVoted { voter_id, message_id })
                } else {
                    warn!("Vote by {} on {} failed: {:#}", voter_id, message_id, err);
                    Err(from_store(err))
                }
            }
        }
    }

    /// Restart the quiet period after a vote-collection change. When it
    /// elapses the radius of every voted pin in the window is written back.
    /// Only confirmed votes count.
    pub fn schedule_write_back(&mut self, messages: &Reconciler<ChatMessage>, votes: &Reconciler<Vote>) {
        let confirmed: Vec<&Vote> = votes.confirmed().collect();
        let plan = radius_plan(messages.confirmed(), &confirmed);
        if plan.is_empty() {
            self.write_back.cancel();
            return;
        }

        let store = self.store.clone();
        self.write_back.schedule(async move {
            for update in plan {
                match apply_radius(&store, update.pin_id, update.radius_meters).await {
                    Ok(true) => info!("Pin {} radius now {}m", update.pin_id, update.radius_meters),
                    Ok(false) => debug!("Pin {} radius unchanged", update.pin_id),
                    // enrichment only: never surfaced
                    Err(e) => warn!("Radius write-back for pin {} failed: {}", update.pin_id, e),
                }
            }
        });
    }

    pub fn cancel_write_back(&mut self) {
        self.write_back.cancel();
    }

    pub fn write_back_pending(&self) -> bool {
        self.write_back.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinboard_feed::FeedMessage;
    use pinboard_types::api::{NewMessage, NewPin, NewPlace, NewUser};
    use pinboard_types::events::{ChangeEvent, ChangeKind, EventMask, Row, Table};
    use pinboard_types::models::Pin;

    fn vote(voter: Uuid, message: Uuid, bucket: RadiusBucket) -> Vote {
        Vote {
            id: Uuid::new_v4(),
            voter_id: voter,
            message_id: message,
            bucket,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn tie_goes_to_earlier_bucket() {
        let m = Uuid::new_v4();
        let votes = vec![
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo300),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo100),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo300),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo100),
        ];

        assert_eq!(plurality(&votes, m), Some(RadiusBucket::UpTo100));
        assert_eq!(resolve_radius(&votes, m), Some(50));
        // same answer on a second run
        assert_eq!(resolve_radius(&votes, m), Some(50));
    }

    #[test]
    fn clear_winner_resolves_to_midpoint() {
        let m = Uuid::new_v4();
        let votes = vec![
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo100),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo1000),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo1000),
            vote(Uuid::new_v4(), Uuid::new_v4(), RadiusBucket::UpTo100),
        ];
        assert_eq!(resolve_radius(&votes, m), Some(750));
    }

    #[test]
    fn no_votes_no_radius() {
        let votes: Vec<Vote> = vec![vote(Uuid::new_v4(), Uuid::new_v4(), RadiusBucket::UpTo500)];
        assert_eq!(resolve_radius(&votes, Uuid::new_v4()), None);
    }

    #[test]
    fn tally_marks_own_bucket_and_counts_each_voter_once() {
        let m = Uuid::new_v4();
        let me = Uuid::new_v4();
        let votes = vec![
            vote(me, m, RadiusBucket::UpTo500),
            vote(me, m, RadiusBucket::UpTo5000),
            vote(Uuid::new_v4(), m, RadiusBucket::UpTo500),
        ];

        let t = tally(&votes, m, me);
        assert_eq!(t.len(), 6);
        assert_eq!(t[2], BucketTally { bucket: RadiusBucket::UpTo500, count: 2, user_voted: true });
        assert_eq!(t[5].count, 0);
        assert_eq!(t.iter().filter(|b| b.user_voted).count(), 1);
    }

    #[test]
    fn plan_covers_voted_pin_notifications_only() {
        let pin_id = Uuid::new_v4();
        let announced = ChatMessage {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            text: "placed a pin".into(),
            kind: MessageKind::PinNotification,
            related_place_id: None,
            related_pin_id: Some(pin_id),
            created_at: Utc::now(),
        };
        let unvoted = ChatMessage {
            id: Uuid::new_v4(),
            related_pin_id: Some(Uuid::new_v4()),
            ..announced.clone()
        };
        let chatter = ChatMessage {
            id: Uuid::new_v4(),
            kind: MessageKind::Text,
            related_pin_id: None,
            ..announced.clone()
        };
        let votes = [
            vote(Uuid::new_v4(), announced.id, RadiusBucket::UpTo2000),
            vote(Uuid::new_v4(), chatter.id, RadiusBucket::UpTo100),
        ];
        let refs: Vec<&Vote> = votes.iter().collect();

        let plan = radius_plan([&announced, &unvoted, &chatter], &refs);
        assert_eq!(
            plan,
            vec![RadiusUpdate { message_id: announced.id, pin_id, radius_meters: 1500 }]
        );
    }

    struct Fixture {
        store: Store,
        users: Vec<Uuid>,
        pin: Pin,
        message: ChatMessage,
    }

    async fn fixture(voters: usize) -> Fixture {
        let store = Store::in_memory().unwrap();
        let mut users = Vec::new();
        for i in 0..voters {
            let user = store
                .insert_user(NewUser { id: Uuid::new_v4(), username: format!("user{}", i), avatar_url: None })
                .await
                .unwrap();
            users.push(user.id);
        }
        let place = store
            .insert_place(NewPlace {
                name: "Kiosk".into(),
                image_ref: "https://img/kiosk.png".into(),
                color: "#10B981".into(),
                owner_id: users[0],
            })
            .await
            .unwrap();
        let pin = store
            .insert_pin(NewPin {
                title: "here".into(),
                description: None,
                latitude: 50.0,
                longitude: 8.0,
                place_id: place.id,
                owner_id: users[0],
                radius_meters: 100,
                camera_image_ref: None,
                place_image_ref: None,
            })
            .await
            .unwrap();
        let message = store
            .insert_message(NewMessage {
                author_id: users[0],
                text: "placed a pin".into(),
                kind: MessageKind::PinNotification,
                related_place_id: None,
                related_pin_id: Some(pin.id),
            })
            .await
            .unwrap();
        Fixture { store, users, pin, message }
    }

    #[tokio::test]
    async fn second_cast_is_already_voted_and_tally_unchanged() {
        let f = fixture(1).await;
        let consensus = VoteConsensus::new(f.store.clone(), Duration::from_millis(10));
        let mut votes = Reconciler::new();

        consensus
            .cast_vote(&mut votes, f.users[0], f.message.id, RadiusBucket::UpTo300)
            .await
            .unwrap();
        let before = tally(votes.iter(), f.message.id, f.users[0]);

        let err = consensus
            .cast_vote(&mut votes, f.users[0], f.message.id, RadiusBucket::UpTo100)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::AlreadyVoted { .. }));
        assert_eq!(tally(votes.iter(), f.message.id, f.users[0]), before);
        assert!(votes.pending().is_empty());
    }

    #[tokio::test]
    async fn lost_race_rolls_back_and_reports_already_voted() {
        let f = fixture(1).await;
        let consensus = VoteConsensus::new(f.store.clone(), Duration::from_millis(10));

        // another client of the same user wrote first; this one has not seen it
        f.store
            .insert_vote(NewVote { voter_id: f.users[0], message_id: f.message.id, bucket: RadiusBucket::UpTo500 })
            .await
            .unwrap();
        let mut votes = Reconciler::new();

        let err = consensus
            .cast_vote(&mut votes, f.users[0], f.message.id, RadiusBucket::UpTo100)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::AlreadyVoted { .. }));
        assert!(votes.is_empty());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_optimistic_vote() {
        let f = fixture(1).await;
        let consensus = VoteConsensus::new(f.store.clone(), Duration::from_millis(10));
        let mut votes = Reconciler::new();

        // unknown message: foreign key violation
        let err = consensus
            .cast_vote(&mut votes, f.users[0], Uuid::new_v4(), RadiusBucket::UpTo100)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::WriteRejected(_)));
        assert!(votes.is_empty());
    }

    #[tokio::test]
    async fn burst_of_votes_writes_radius_once() {
        let f = fixture(3).await;
        let mut consensus = VoteConsensus::new(f.store.clone(), Duration::from_millis(50));
        let mut messages = Reconciler::new();
        messages.load_snapshot(vec![f.message.clone()]);
        let mut votes = Reconciler::new();
        let mut pins = f.store.subscribe(Table::Pins, EventMask::only(ChangeKind::Update));

        for (user, bucket) in f.users.iter().zip([RadiusBucket::UpTo2000, RadiusBucket::UpTo2000, RadiusBucket::UpTo100]) {
            let v = vote(*user, f.message.id, bucket);
            votes.apply_event(ChangeEvent::insert(Row::Vote(v)));
            consensus.schedule_write_back(&messages, &votes);
        }
        assert!(consensus.write_back_pending());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut updates = Vec::new();
        while let Some(FeedMessage::Change(event)) = pins.try_next() {
            updates.push(event);
        }
        assert_eq!(updates.len(), 1);
        assert_eq!(f.store.get_pin(f.pin.id).await.unwrap().unwrap().radius_meters, 1500);

        // redundant firing on the same vote set changes nothing
        consensus.schedule_write_back(&messages, &votes);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pins.try_next().is_none());
    }

    #[tokio::test]
    async fn provisional_votes_do_not_drive_write_back() {
        let f = fixture(1).await;
        let mut consensus = VoteConsensus::new(f.store.clone(), Duration::from_millis(10));
        let mut messages = Reconciler::new();
        messages.load_snapshot(vec![f.message.clone()]);
        let mut votes = Reconciler::new();

        let temp = Uuid::new_v4();
        votes.apply_optimistic(temp, vote(f.users[0], f.message.id, RadiusBucket::UpTo5000));
        consensus.schedule_write_back(&messages, &votes);

        assert!(!consensus.write_back_pending());
    }
}
