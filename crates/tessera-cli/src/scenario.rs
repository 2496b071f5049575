//! Scripted group lifecycle against an in-process cloud.
//!
//! One initiator creates a group with every other user, messages flow both
//! ways, the last member is removed, the survivors catch up and the group is
//! deleted. Any deviation from the expected outcome is an error.

use std::sync::Arc;

use thiserror::Error;
use tessera_core::{
    Card, Dependencies, Environment, Group, GroupConfig, GroupError, Identity, LocalKeyPair,
    MemoryCloud, MemoryDirectory, Storage, StorageError, UserSession,
};
use tracing::{debug, info};

/// Scenario failures
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A group operation failed
    #[error(transparent)]
    Group(#[from] GroupError),

    /// A user's storage could not be opened
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A message decrypted to the wrong plaintext
    #[error("{reader} read {actual:?}, expected {expected:?}")]
    Mismatch {
        /// Identity that decrypted
        reader: Identity,
        /// Plaintext that was sent
        expected: String,
        /// Plaintext that came out
        actual: String,
    },

    /// A removed member could still refresh the group
    #[error("{0} kept access after removal")]
    RemovedMemberKeptAccess(Identity),

    /// Fewer users than a group needs
    #[error("need at least 2 participants, got {0}")]
    TooFewParticipants(usize),
}

/// Scenario size and group tuning.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Users in the group, initiator included
    pub participants: usize,
    /// Messages the initiator sends before the removal
    pub messages: usize,
    /// Group tuning shared by every user
    pub config: GroupConfig,
}

/// What the scenario did.
#[derive(Debug, Default)]
pub struct Report {
    /// Highest epoch reached
    pub epochs: u32,
    /// Successful decryptions
    pub delivered: usize,
    /// Member removed near the end, if the group was large enough
    pub removed: Option<Identity>,
}

struct User<S: Storage, E: Environment> {
    session: UserSession<S, E>,
    card: Card,
    env: E,
}

/// Run the scenario with storage and environment built per user.
pub async fn run<S, E>(
    settings: &Settings,
    storage_for: impl Fn(&str) -> Result<S, StorageError>,
    env_for: impl Fn(u64) -> E,
) -> Result<Report, ScenarioError>
where
    S: Storage,
    E: Environment,
{
    if settings.participants < 2 {
        return Err(ScenarioError::TooFewParticipants(settings.participants));
    }

    let cloud = MemoryCloud::new();
    let directory = MemoryDirectory::new();

    let mut users = Vec::with_capacity(settings.participants);
    for index in 0..settings.participants {
        let name = format!("user-{index}");
        let env = env_for(u64::try_from(index).unwrap_or(u64::MAX));
        let key_pair = LocalKeyPair::generate(Identity::new(name.as_str()), &env);
        let card = key_pair.card(env.wall_clock_secs());
        directory.publish(card.clone());

        let mut session = UserSession::new(Dependencies {
            storage: storage_for(&name)?,
            directory: Arc::new(directory.clone()),
            config: settings.config,
            env: env.clone(),
        });
        session.establish(key_pair.clone(), Arc::new(cloud.client(key_pair)))?;
        users.push(User { session, card, env });
    }

    let (initiator, members) = users.split_at(1);
    let initiator = &initiator[0];
    let identifier: [u8; 32] = initiator.env.random_array();
    let mut report = Report::default();

    let member_cards: Vec<Card> = members.iter().map(|user| user.card.clone()).collect();
    let mut group = initiator.session.context()?.create_group(&identifier, &member_cards).await?;
    info!(
        session = %group.session_id().short(),
        participants = group.participants().len(),
        "group created"
    );

    let mut member_groups = Vec::with_capacity(members.len());
    for member in members {
        let loaded = member.session.context()?.load_group(&identifier, &initiator.card).await?;
        member_groups.push(loaded);
    }

    for index in 0..settings.messages {
        let text = format!("message {index} from {}", initiator.card.identity());
        let sealed = group.encrypt(text.as_bytes())?;
        for (member, member_group) in members.iter().zip(&member_groups) {
            report.delivered +=
                deliver(member_group, member, &sealed, &initiator.card, &text).await?;
        }
    }

    for (member, member_group) in members.iter().zip(&member_groups) {
        let text = format!("reply from {}", member.card.identity());
        let sealed = member_group.encrypt(text.as_bytes())?;
        report.delivered += deliver(&group, initiator, &sealed, &member.card, &text).await?;
    }

    if members.len() > 1
        && let (Some(removed), Some(mut removed_group)) = (members.last(), member_groups.pop())
    {
        group.remove(std::slice::from_ref(&removed.card)).await?;
        info!(removed = %removed.card.identity(), epoch = group.epoch(), "member removed");

        let text = "after removal".to_string();
        let sealed = group.encrypt(text.as_bytes())?;
        for (member, member_group) in members.iter().zip(&mut member_groups) {
            member_group.update().await?;
            report.delivered +=
                deliver(member_group, member, &sealed, &initiator.card, &text).await?;
        }

        match removed_group.update().await {
            Err(GroupError::GroupWasNotFound) => {
                debug!(identity = %removed.card.identity(), "removed member lost access");
            },
            Ok(()) => {
                let identity = removed.card.identity().clone();
                return Err(ScenarioError::RemovedMemberKeptAccess(identity));
            },
            Err(err) => return Err(err.into()),
        }
        report.removed = Some(removed.card.identity().clone());
    }

    report.epochs = group.epoch();
    initiator.session.context()?.delete_group(&identifier).await?;
    info!(remaining = cloud.value_count(), "group deleted");

    Ok(report)
}

async fn deliver<S: Storage, E: Environment>(
    group: &Group<S, E>,
    reader: &User<S, E>,
    sealed: &[u8],
    sender: &Card,
    expected: &str,
) -> Result<usize, ScenarioError> {
    let plaintext = group.decrypt(sealed, sender, None).await?;
    let actual = String::from_utf8_lossy(&plaintext);
    if actual != expected {
        return Err(ScenarioError::Mismatch {
            reader: reader.card.identity().clone(),
            expected: expected.to_string(),
            actual: actual.into_owned(),
        });
    }
    Ok(1)
}
