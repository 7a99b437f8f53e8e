//! `vigilctl` — administrative frontend for the vigil daemon.
//!
//! Talks to the daemon's admin socket. Exit code 0 on success; on failure
//! the absolute value of the admin API's numeric error code.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod bulk;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vigil_client::error::ClientError;
use vigil_client::AdminClient;
use vigil_core::types::{Policy, PolicyKey, PolicyResult};

/// vigil policy administration.
#[derive(Parser)]
#[command(
    name = "vigilctl",
    version,
    about = "vigilctl — manage vigil policy buckets and rules",
    after_help = "Key slots accept literals, the wildcard `*` (stored keys), \
                  and the any-marker `#` (list/erase filters only)."
)]
struct Cli {
    /// Runtime directory holding the daemon's sockets.
    #[arg(long, env = "VIGIL_RUNTIME_DIR", default_value = "/run/vigil")]
    runtime_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a bucket or replace its default result.
    SetBucket {
        /// Bucket id ("" is the root bucket).
        bucket: String,
        /// Default result type (allow, deny, none, hex, or decimal).
        #[arg(long = "type", value_name = "TYPE")]
        policy_type: String,
        /// Default result metadata.
        #[arg(long, default_value = "")]
        metadata: String,
    },

    /// Delete a bucket (links to it are removed everywhere).
    DeleteBucket { bucket: String },

    /// Insert or update a single policy, or many with --bulk.
    SetPolicy {
        /// Target bucket.
        #[arg(long, default_value = "")]
        bucket: String,
        /// Read `bucket;client;user;privilege;type;metadata` records from a
        /// file, or `-` for stdin; positional arguments are ignored.
        #[arg(long, value_name = "PATH")]
        bulk: Option<String>,
        client: Option<String>,
        user: Option<String>,
        privilege: Option<String>,
        /// Result type (allow, deny, bucket, hex, or decimal).
        #[arg(long = "type", value_name = "TYPE")]
        policy_type: Option<String>,
        /// Result metadata (link target for bucket policies).
        #[arg(long, default_value = "")]
        metadata: String,
    },

    /// Remove policies matching a filter.
    Erase {
        /// Bucket to start from.
        #[arg(long = "bucket", default_value = "")]
        start_bucket: String,
        /// Follow links into reachable buckets.
        #[arg(long, short)]
        recursive: bool,
        client: String,
        user: String,
        privilege: String,
    },

    /// Evaluate a key the way the daemon would.
    Check {
        /// Bucket to start from.
        #[arg(long = "bucket", default_value = "")]
        start_bucket: String,
        /// Follow links into reachable buckets.
        #[arg(long, short, default_value_t = true)]
        recursive: bool,
        client: String,
        user: String,
        privilege: String,
    },

    /// List the policies of a bucket passing a filter.
    ListPolicies {
        bucket: String,
        client: String,
        user: String,
        privilege: String,
        /// Emit JSON instead of the record format.
        #[arg(long)]
        json: bool,
    },

    /// List every policy type the daemon knows.
    ListPoliciesDescriptions,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("vigilctl: {err:#}");
            ExitCode::from(exit_value(&err))
        }
    }
}

/// The CLI exit value: the absolute value of the API code, clamped to the
/// u8 range.
fn exit_value(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<ClientError>()
        .map_or(vigil_core::ApiCode::UnexpectedError, ClientError::api_code);
    u8::try_from(code.raw().unsigned_abs()).unwrap_or(u8::MAX)
}

fn run(cli: Cli) -> Result<()> {
    let socket = cli.runtime_dir.join("admin");
    let mut admin = AdminClient::connect(&socket)
        .with_context(|| format!("connecting to {}", socket.display()))?;

    match cli.command {
        Command::SetBucket {
            bucket,
            policy_type,
            metadata,
        } => {
            let policy_type = bulk::parse_type(&policy_type)?;
            admin.set_bucket(&bucket, PolicyResult::new(policy_type, metadata))?;
        }

        Command::DeleteBucket { bucket } => admin.delete_bucket(&bucket)?,

        Command::SetPolicy {
            // Bulk records name their own buckets; the --bucket flag only
            // applies to the single-policy form.
            bucket: _,
            bulk: Some(path),
            ..
        } => {
            let input = read_bulk_input(&path)?;
            let insert = bulk::parse_policies(&input)?;
            admin.set_policies(insert, BTreeMap::new())?;
        }

        Command::SetPolicy {
            bucket,
            bulk: None,
            client,
            user,
            privilege,
            policy_type,
            metadata,
        } => {
            let (Some(client), Some(user), Some(privilege), Some(policy_type)) =
                (client, user, privilege, policy_type)
            else {
                anyhow::bail!("set-policy needs <client> <user> <privilege> --type (or --bulk)");
            };
            let key = new_key(&client, &user, &privilege)?;
            let policy_type = bulk::parse_type(&policy_type)?;
            let mut insert = BTreeMap::new();
            insert.insert(
                bucket,
                vec![Policy::new(key, PolicyResult::new(policy_type, metadata))],
            );
            admin.set_policies(insert, BTreeMap::new())?;
        }

        Command::Erase {
            start_bucket,
            recursive,
            client,
            user,
            privilege,
        } => {
            let filter = new_key(&client, &user, &privilege)?;
            admin.erase(&start_bucket, recursive, filter)?;
        }

        Command::Check {
            start_bucket,
            recursive,
            client,
            user,
            privilege,
        } => {
            let key = new_key(&client, &user, &privilege)?;
            let outcome = admin.admin_check(&start_bucket, recursive, key)?;
            if outcome.db_corrupted {
                eprintln!("warning: policy database is corrupted");
            }
            if !outcome.bucket_valid {
                return Err(ClientError::Operation {
                    code: vigil_core::OperationCode::NoBucket,
                }
                .into());
            }
            println!("{};{}", outcome.result.policy_type(), outcome.result.metadata());
        }

        Command::ListPolicies {
            bucket,
            client,
            user,
            privilege,
            json,
        } => {
            let filter = new_key(&client, &user, &privilege)?;
            let policies = admin.list_policies(&bucket, filter)?;
            if json {
                let rows: Vec<serde_json::Value> = policies
                    .iter()
                    .map(|policy| {
                        serde_json::json!({
                            "bucket": bucket,
                            "client": policy.key.client(),
                            "user": policy.key.user(),
                            "privilege": policy.key.privilege(),
                            "type": format!("{}", policy.result.policy_type()),
                            "metadata": policy.result.metadata(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for policy in policies {
                    println!(
                        "{};{};{};{};{};{}",
                        bucket,
                        policy.key.client(),
                        policy.key.user(),
                        policy.key.privilege(),
                        policy.result.policy_type(),
                        policy.result.metadata()
                    );
                }
            }
        }

        Command::ListPoliciesDescriptions => {
            for description in admin.list_descriptions()? {
                println!("{};{}", description.policy_type, description.name);
            }
        }
    }

    Ok(())
}

fn new_key(client: &str, user: &str, privilege: &str) -> Result<PolicyKey> {
    PolicyKey::new(client, user, privilege).map_err(|err| {
        anyhow::Error::from(ClientError::InvalidParam {
            reason: err.to_string(),
        })
    })
}

fn read_bulk_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("reading stdin")?;
        Ok(input)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vigilctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn set_bucket_parses_type_and_metadata() {
        let cli = parse(&["set-bucket", "extra", "--type", "none"]);
        let Command::SetBucket {
            bucket,
            policy_type,
            metadata,
        } = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(bucket, "extra");
        assert_eq!(policy_type, "none");
        assert_eq!(metadata, "");
    }

    #[test]
    fn set_policy_single_form_parses() {
        let cli = parse(&[
            "set-policy", "--bucket", "extra", "app", "alice", "net", "--type", "allow",
        ]);
        let Command::SetPolicy {
            bucket,
            bulk,
            client,
            policy_type,
            ..
        } = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(bucket, "extra");
        assert!(bulk.is_none());
        assert_eq!(client.as_deref(), Some("app"));
        assert_eq!(policy_type.as_deref(), Some("allow"));
    }

    #[test]
    fn set_policy_bulk_form_needs_no_positionals() {
        let cli = parse(&["set-policy", "--bulk", "-"]);
        let Command::SetPolicy { bulk, client, .. } = cli.command else {
            panic!("wrong command");
        };
        assert_eq!(bulk.as_deref(), Some("-"));
        assert!(client.is_none());
    }

    #[test]
    fn erase_and_check_take_key_slots() {
        let cli = parse(&["erase", "--recursive", "#", "alice", "#"]);
        let Command::Erase {
            recursive, client, ..
        } = cli.command
        else {
            panic!("wrong command");
        };
        assert!(recursive);
        assert_eq!(client, "#");

        let cli = parse(&["check", "app", "alice", "net"]);
        assert!(matches!(cli.command, Command::Check { .. }));
    }

    #[test]
    fn exit_value_uses_api_code_magnitude() {
        let err = anyhow::Error::from(ClientError::ServiceNotAvailable);
        assert_eq!(exit_value(&err), 5);
        let err = anyhow::Error::from(ClientError::Operation {
            code: vigil_core::OperationCode::NoBucket,
        });
        assert_eq!(exit_value(&err), 8);
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_value(&err), 19);
    }
}
