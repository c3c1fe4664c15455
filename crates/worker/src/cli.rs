use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use jobsync_core::{PriorityTier, StreamId};
use jobsync_infra::config;

#[derive(Parser, Debug)]
#[command(name = "jobsync", version, about = "Durable job queue worker and incremental sync")]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that take precedence over the environment.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// PostgreSQL connection string.
    #[arg(long, global = true, value_name = "URL")]
    pub database_url: Option<String>,

    /// Idle sleep between empty claims, in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Heartbeat period while a job runs, in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Base URL of the external API used by `poll` and `sync.poll` jobs.
    #[arg(long, global = true, value_name = "URL")]
    pub api_base_url: Option<String>,
}

impl Overrides {
    /// Value of `var`, preferring a flag over the environment.
    pub fn lookup(&self, var: &str) -> Option<String> {
        let flag = match var {
            config::DATABASE_URL => self.database_url.clone(),
            config::POLL_INTERVAL_SECS => self.poll_interval_secs.map(|v| v.to_string()),
            config::HEARTBEAT_SECS => self.heartbeat_secs.map(|v| v.to_string()),
            config::API_BASE_URL => self.api_base_url.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(var).ok())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker loop until SIGINT/SIGTERM.
    Run {
        /// Stop after this many jobs.
        #[arg(long)]
        max_jobs: Option<u64>,

        /// Sleep for the retry delay after a failed job.
        #[arg(long)]
        pause_after_failure: bool,

        /// Do not sweep stale heartbeats from this process.
        #[arg(long)]
        no_reaper: bool,
    },
    /// Claim and process exactly one job.
    Once,
    /// Process jobs until none is claimable.
    Drain,
    /// Process one scheduler batch from a priority tier (1 = urgent .. 4 = low).
    Tier { tier: PriorityTier },
    /// Process one batch from every tier, urgent first.
    Tiers,
    /// Re-run failed jobs whose backoff has elapsed.
    RetrySweep {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Return jobs with stale heartbeats to the queue.
    Reap,
    /// Print queue statistics as JSON.
    Stats,
    /// List dead-lettered jobs, newest first.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Enqueue a fresh copy of a dead-lettered job.
    Requeue { dead_letter_id: i64 },
    /// Delete completed jobs older than N days.
    Prune {
        #[arg(long)]
        older_than_days: u32,
    },
    /// Insert a job.
    Enqueue {
        job_type: String,
        #[arg(value_parser = parse_json)]
        payload: Value,
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<i16>,
        #[arg(long)]
        max_attempts: Option<i32>,
        /// Not claimable before this many seconds from now.
        #[arg(long)]
        delay_secs: Option<u64>,
    },
    /// Incrementally sync a stream from the external API.
    Poll {
        stream: StreamId,
        #[arg(long)]
        page_size: Option<u32>,
        /// Reset the cursor and re-mirror the whole stream.
        #[arg(long)]
        full_resync: bool,
    },
    /// Apply database migrations.
    Migrate,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON payload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_tier_by_number_and_name() {
        let cli = Cli::try_parse_from(["jobsync", "tier", "1"]).unwrap();
        assert!(matches!(cli.command, Command::Tier { tier: PriorityTier::Urgent }));

        let cli = Cli::try_parse_from(["jobsync", "tier", "low"]).unwrap();
        assert!(matches!(cli.command, Command::Tier { tier: PriorityTier::Low }));

        assert!(Cli::try_parse_from(["jobsync", "tier", "5"]).is_err());
    }

    #[test]
    fn parses_enqueue_payload_as_json() {
        let cli = Cli::try_parse_from([
            "jobsync",
            "enqueue",
            "email.send",
            r#"{"to":"ops@example.com"}"#,
            "--priority",
            "4",
        ])
        .unwrap();
        match cli.command {
            Command::Enqueue { job_type, payload, priority, .. } => {
                assert_eq!(job_type, "email.send");
                assert_eq!(payload, json!({"to": "ops@example.com"}));
                assert_eq!(priority, Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["jobsync", "enqueue", "x", "{not json"]).is_err());
    }

    #[test]
    fn parses_poll_flags() {
        let cli = Cli::try_parse_from(["jobsync", "poll", "consignments", "--page-size", "50", "--full-resync"])
            .unwrap();
        match cli.command {
            Command::Poll { stream, page_size, full_resync } => {
                assert_eq!(stream.as_str(), "consignments");
                assert_eq!(page_size, Some(50));
                assert!(full_resync);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["jobsync", "poll", "Bad Stream"]).is_err());
    }

    #[test]
    fn global_flags_override_environment() {
        let cli = Cli::try_parse_from([
            "jobsync",
            "stats",
            "--database-url",
            "postgres://flag/jobs",
            "--heartbeat-secs",
            "7",
        ])
        .unwrap();
        assert_eq!(
            cli.overrides.lookup(config::DATABASE_URL).as_deref(),
            Some("postgres://flag/jobs")
        );
        assert_eq!(cli.overrides.lookup(config::HEARTBEAT_SECS).as_deref(), Some("7"));
    }

    #[test]
    fn dead_letter_defaults() {
        let cli = Cli::try_parse_from(["jobsync", "dead-letters"]).unwrap();
        assert!(matches!(cli.command, Command::DeadLetters { limit: 50 }));

        let cli = Cli::try_parse_from(["jobsync", "prune", "--older-than-days", "30"]).unwrap();
        assert!(matches!(cli.command, Command::Prune { older_than_days: 30 }));
    }
}
