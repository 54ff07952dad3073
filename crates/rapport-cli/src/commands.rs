//! Subcommands and their dispatch onto [`SocialGraph`].

use anyhow::Context as _;
use clap::{Subcommand, ValueEnum};
use rapport_core::{
  SocialGraph, UserId,
  context::OpContext,
  relationship::{
    Direction, PageRequest, RelationshipFilter, RelationshipKind, RelationshipStatus,
  },
  spam::DetectionType,
  store::GraphStore,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

// ─── Arguments ────────────────────────────────────────────────────────────────

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Follow a user.
  Follow { target: UserId },

  /// Send a friend request.
  Request { target: UserId },

  /// Answer a friend request addressed to you.
  Respond {
    request_id: Uuid,
    #[arg(value_enum)]
    answer:     Answer,
  },

  /// Retire a relationship of the given kind (`follow`, `friend_request`,
  /// `mute`, `block`).
  Remove { kind: RelationshipKind, target: UserId },

  Block { target: UserId },

  Unblock { target: UserId },

  Mute { target: UserId },

  /// List relationships touching you, newest first.
  List {
    #[arg(long)]
    kind:   Option<RelationshipKind>,
    /// Without a status, removed and block-suppressed rows are hidden.
    #[arg(long)]
    status: Option<RelationshipStatus>,
    #[arg(long, value_enum, default_value_t = Side::Outgoing)]
    side:   Side,
    #[command(flatten)]
    page:   PageArgs,
  },

  /// Friend requests waiting for your answer.
  Pending {
    #[command(flatten)]
    page: PageArgs,
  },

  /// Relationship counters for a user (default: you).
  Stats { user: Option<UserId> },

  /// Whether you and `other` are friends.
  Friends { other: UserId },

  /// Account group administration.
  #[command(subcommand)]
  Group(GroupCommand),

  /// Spam flag inspection and resets.
  #[command(subcommand)]
  Flags(FlagsCommand),

  /// Rate-limit inspection and resets.
  #[command(subcommand)]
  Limits(LimitsCommand),
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
  /// Start a new group containing you.
  Create {
    #[arg(long)]
    primary: bool,
  },
  Add {
    group: Uuid,
    user:  UserId,
    #[arg(long)]
    primary: bool,
  },
  Remove { group: Uuid, user: UserId },
  /// Make `user` the group's primary account.
  Primary { group: Uuid, user: UserId },
  /// Show a group (default: the one you belong to).
  Show { group: Option<Uuid> },
}

#[derive(Subcommand, Debug)]
pub enum FlagsCommand {
  List {
    user: Option<UserId>,
    /// Only flags at or above their reporting threshold.
    #[arg(long)]
    active: bool,
  },
  /// Zero one detection type, or all of them when none is given.
  Reset {
    user:      UserId,
    detection: Option<DetectionType>,
  },
}

#[derive(Subcommand, Debug)]
pub enum LimitsCommand {
  Show { action: RelationshipKind, user: Option<UserId> },
  Reset { action: RelationshipKind, user: Option<UserId> },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Answer {
  Accept,
  Reject,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Side {
  Outgoing,
  Incoming,
  Both,
}

impl From<Side> for Direction {
  fn from(side: Side) -> Self {
    match side {
      Side::Outgoing => Direction::Outgoing,
      Side::Incoming => Direction::Incoming,
      Side::Both => Direction::Both,
    }
  }
}

#[derive(clap::Args, Debug)]
pub struct PageArgs {
  #[arg(long, default_value_t = PageRequest::DEFAULT_LIMIT)]
  limit:  usize,
  #[arg(long, default_value_t = 0)]
  offset: usize,
}

impl From<PageArgs> for PageRequest {
  fn from(args: PageArgs) -> Self { PageRequest::new(args.limit, args.offset) }
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Run one command as `actor` and print its result as JSON.
pub async fn run<S: GraphStore>(
  graph: &SocialGraph<S>,
  cx: &OpContext,
  actor: Option<UserId>,
  command: Command,
) -> anyhow::Result<()> {
  let me = || actor.context("this command needs --as <uuid>");

  match command {
    Command::Follow { target } => print(
      &graph
        .request_relationship(cx, me()?, target, RelationshipKind::Follow)
        .await?,
    ),
    Command::Request { target } => print(
      &graph
        .request_relationship(cx, me()?, target, RelationshipKind::FriendRequest)
        .await?,
    ),
    Command::Mute { target } => print(
      &graph
        .request_relationship(cx, me()?, target, RelationshipKind::Mute)
        .await?,
    ),
    Command::Respond { request_id, answer } => {
      let accept = matches!(answer, Answer::Accept);
      print(&graph.respond_to_request(cx, me()?, request_id, accept).await?)
    }
    Command::Remove { kind, target } => {
      print(&graph.remove_relationship(cx, me()?, target, kind).await?)
    }
    Command::Block { target } => print(&graph.block_user(cx, me()?, target).await?),
    Command::Unblock { target } => print(&graph.unblock_user(cx, me()?, target).await?),
    Command::List { kind, status, side, page } => {
      let filter = RelationshipFilter { kind, status, direction: side.into() };
      print(&graph.list_relationships(cx, me()?, filter, page.into()).await?)
    }
    Command::Pending { page } => {
      print(&graph.pending_requests(cx, me()?, page.into()).await?)
    }
    Command::Stats { user } => {
      let user = user.map_or_else(me, Ok)?;
      print(&graph.stats(cx, user).await?)
    }
    Command::Friends { other } => {
      let friends = graph.are_friends(cx, me()?, other).await?;
      print(&json!({ "friends": friends }))
    }
    Command::Group(cmd) => run_group(graph, cx, me, cmd).await,
    Command::Flags(cmd) => run_flags(graph, cx, me, cmd).await,
    Command::Limits(cmd) => run_limits(graph, cx, me, cmd).await,
  }
}

async fn run_group<S: GraphStore>(
  graph: &SocialGraph<S>,
  cx: &OpContext,
  me: impl Fn() -> anyhow::Result<UserId>,
  cmd: GroupCommand,
) -> anyhow::Result<()> {
  match cmd {
    GroupCommand::Create { primary } => {
      print(&graph.create_group_with_user(cx, me()?, primary).await?)
    }
    GroupCommand::Add { group, user, primary } => {
      graph.add_user_to_group(cx, group, user, primary).await?;
      print(&graph.members_of(cx, group).await?)
    }
    GroupCommand::Remove { group, user } => {
      let dissolved = graph.remove_user_from_group(cx, group, user).await?;
      print(&json!({ "group_id": group, "user_id": user, "dissolved": dissolved }))
    }
    GroupCommand::Primary { group, user } => {
      graph.set_primary_account(cx, group, user).await?;
      print(&graph.members_of(cx, group).await?)
    }
    GroupCommand::Show { group } => {
      let group = match group {
        Some(id) => id,
        None => graph
          .group_for_user(cx, me()?)
          .await?
          .context("you are not in an account group")?,
      };
      print(&graph.members_of(cx, group).await?)
    }
  }
}

async fn run_flags<S: GraphStore>(
  graph: &SocialGraph<S>,
  cx: &OpContext,
  me: impl Fn() -> anyhow::Result<UserId>,
  cmd: FlagsCommand,
) -> anyhow::Result<()> {
  match cmd {
    FlagsCommand::List { user, active } => {
      let user = user.map_or_else(&me, Ok)?;
      let flags = if active {
        graph.active_flags(cx, user).await?
      } else {
        graph.flags_for_user(cx, user).await?
      };
      print(&flags)
    }
    FlagsCommand::Reset { user, detection: Some(detection) } => {
      print(&graph.reset_flag(cx, user, detection).await?)
    }
    FlagsCommand::Reset { user, detection: None } => {
      let reset = graph.reset_all_flags(cx, user).await?;
      print(&json!({ "user_id": user, "reset": reset }))
    }
  }
}

async fn run_limits<S: GraphStore>(
  graph: &SocialGraph<S>,
  cx: &OpContext,
  me: impl Fn() -> anyhow::Result<UserId>,
  cmd: LimitsCommand,
) -> anyhow::Result<()> {
  match cmd {
    LimitsCommand::Show { action, user } => {
      let user = user.map_or_else(&me, Ok)?;
      print(&graph.rate_limit_record(cx, user, action.action()).await?)
    }
    LimitsCommand::Reset { action, user } => {
      let user = user.map_or_else(&me, Ok)?;
      graph.reset_rate_limit(cx, user, action.action()).await?;
      tracing::info!(%user, %action, "rate limit reset");
      print(&json!({ "user_id": user, "action": action, "reset": true }))
    }
  }
}
