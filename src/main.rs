#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use libp2p::PeerId;

use peerup::{
    api::{self, Request},
    config::{Config, RelayDescriptor, edit},
    lifecycle::{self, FileLock},
    snapshot,
};
use service::{authorized::AuthorizedPeers, short_peer};

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Configuration file path
    ///
    /// Example: peerup --config /etc/peerup/config.toml daemon
    ///
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node daemon
    Daemon,
    /// Show daemon status
    Status,
    /// List configured services and their traffic counters
    Services,
    /// List connected peers
    Peers,
    /// Round-trip a ping to a peer or name
    Ping { target: String },
    /// Forward a local TCP address to a remote service
    Connect {
        local: String,
        target: String,
        service: String,
    },
    /// Stop a forward
    Disconnect { local: String },
    /// Manage the authorized-peer set
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Create an invite code for another device
    Invite {
        /// Friendly name the other device will know this node by
        #[arg(long, default_value = "home")]
        name: String,
        /// Invite lifetime in seconds
        #[arg(long, default_value_t = 600)]
        ttl: u64,
    },
    /// Redeem an invite code from another device
    Join {
        code: String,
        /// Friendly name the inviter will know this device by
        #[arg(long)]
        name: String,
        /// Inviter peer id, required for legacy v1 codes
        #[arg(long)]
        peer: Option<String>,
    },
    /// Apply a new config under commit-confirmed
    Apply {
        file: PathBuf,
        /// Seconds until an unconfirmed change reverts
        #[arg(long, default_value_t = 120)]
        confirm_timeout: u64,
    },
    /// Confirm a pending config change
    Confirm,
    /// Restore the last-known-good config
    Rollback,
    /// Snapshot the node state files, or restore one
    Snapshot {
        #[arg(long)]
        list: bool,
        #[arg(long)]
        restore: Option<String>,
    },
    /// Manage configured relays
    Relay {
        #[command(subcommand)]
        command: RelayCommand,
    },
    /// Stop a running daemon
    Stop,
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// List authorized peers in file order
    List,
    /// Authorize a peer
    Add {
        peer: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Remove a peer
    Remove { peer: String },
    /// Record an out-of-band fingerprint confirmation
    Verify { peer: String, fingerprint: String },
}

#[derive(Subcommand, Debug)]
enum RelayCommand {
    /// Add a relay address
    Add { address: String },
    /// Remove a relay address (the last one cannot be removed)
    Remove { address: String },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Recovery commands must keep working when the live config is the
    // thing that broke, so they run before the config is parsed.
    match &cli.command {
        Command::Daemon => {
            let config = Config::load(&cli.config)?;
            simple_logger::init_with_level(config.log.level.as_level())?;
            return peerup::startup(config, cli.config).await;
        }

        Command::Rollback => {
            simple_logger::init_with_level(log::Level::Warn)?;
            let _lock = FileLock::acquire(&peerup::config_dir_of(&cli.config))?;
            lifecycle::rollback(&cli.config)?;
            println!("restored the last-known-good config");
            return Ok(());
        }

        Command::Confirm => {
            simple_logger::init_with_level(log::Level::Warn)?;
            return confirm(&cli.config).await;
        }

        Command::Snapshot { list, restore } if *list || restore.is_some() => {
            simple_logger::init_with_level(log::Level::Warn)?;
            let config_dir = peerup::config_dir_of(&cli.config);

            if *list {
                for name in snapshot::list(&config_dir)? {
                    println!("{name}");
                }
                return Ok(());
            }

            if let Some(name) = restore {
                let _lock = FileLock::acquire(&config_dir)?;
                let restored = snapshot::restore(&config_dir, name)?;
                println!("restored {} file(s) from {name}", restored.len());
            }
            return Ok(());
        }

        _ => {}
    }

    simple_logger::init_with_level(log::Level::Warn)?;
    let config = Config::load(&cli.config)?;
    let config_dir = peerup::config_dir_of(&cli.config);
    let socket = config.admin_socket_in(&config_dir);

    match cli.command {
        Command::Daemon | Command::Rollback | Command::Confirm => unreachable!(),

        Command::Status => call(&socket, Request::Status).await,
        Command::Services => call(&socket, Request::ServicesList).await,
        Command::Peers => call(&socket, Request::PeersList).await,

        Command::Ping { target } => {
            match api::call(&socket, Request::Ping { target: target.clone() }).await {
                Ok(response) => print_response(response),
                Err(_) if config.admin.allow_direct => {
                    direct_ping(config, cli.config, &target).await
                }
                Err(error) => Err(error),
            }
        }

        Command::Connect {
            local,
            target,
            service,
        } => {
            call(
                &socket,
                Request::ProxyConnect {
                    local,
                    target,
                    service,
                },
            )
            .await
        }

        Command::Disconnect { local } => {
            call(&socket, Request::ProxyDisconnect { local }).await
        }

        Command::Auth { command } => {
            let _lock = FileLock::acquire(&config_dir)?;
            let path = config
                .authorized_keys_file_in(&config_dir)
                .unwrap_or_else(|| config_dir.join("authorized_keys"));
            let authorized = AuthorizedPeers::load(&path)?;

            match command {
                AuthCommand::List => {
                    for entry in authorized.list() {
                        let label = entry.label.as_deref().unwrap_or("-");
                        println!("{}  {}", entry.peer.to_base58(), label);
                        for (key, value) in entry.attrs {
                            println!("    {key}={value}");
                        }
                    }
                    Ok(())
                }
                AuthCommand::Add { peer, label } => {
                    let peer = parse_peer(&peer)?;
                    authorized.add(peer, label)?;
                    println!("authorized {}", short_peer(&peer));
                    hint_reload();
                    Ok(())
                }
                AuthCommand::Remove { peer } => {
                    let peer = parse_peer(&peer)?;
                    authorized.remove(&peer)?;
                    println!("removed {}", short_peer(&peer));
                    hint_reload();
                    Ok(())
                }
                AuthCommand::Verify { peer, fingerprint } => {
                    let peer = parse_peer(&peer)?;
                    authorized.set_attr(&peer, "verified", &fingerprint)?;
                    println!("marked {} as verified", short_peer(&peer));
                    hint_reload();
                    Ok(())
                }
            }
        }

        Command::Invite { name, ttl } => {
            match api::call(&socket, Request::InviteNew {
                name: name.clone(),
                ttl_secs: ttl,
            })
            .await
            {
                Ok(response) => {
                    let response = expect_ok(response)?;
                    let code = response.data["code"].as_str().unwrap_or_default();
                    println!("{code}");
                    println!("# on the other device: peerup join {code} --name <its-name>");
                    Ok(())
                }
                Err(_) if config.admin.allow_direct => {
                    let paired = peerup::invite_direct(
                        config,
                        cli.config,
                        &name,
                        Duration::from_secs(ttl),
                    )
                    .await?;

                    if paired {
                        println!("# paired");
                        Ok(())
                    } else {
                        bail!("invite expired without a pairing")
                    }
                }
                Err(error) => Err(error).context(
                    "the daemon is not running; start it, or set admin.allow-direct to invite without it",
                ),
            }
        }

        Command::Join { code, name, peer } => {
            let _lock = FileLock::acquire(&config_dir)?;
            let peer = peer.map(|it| parse_peer(&it)).transpose()?;

            let report = peerup::join(config, cli.config, &code, &name, peer).await?;

            println!("paired with {} ({})", report.inviter_name, short_peer(&report.inviter));
            println!(
                "verification code {}: the other device must display the same code",
                report.short_code
            );
            Ok(())
        }

        Command::Apply {
            file,
            confirm_timeout,
        } => {
            let _lock = FileLock::acquire(&config_dir)?;
            let candidate = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;

            snapshot_state(&config, &cli.config)?;
            let pending = lifecycle::apply(
                &cli.config,
                &candidate,
                Duration::from_secs(confirm_timeout),
                |content| Config::parse(content).map(|_| ()),
            )?;

            println!(
                "applied; restart the daemon and run `peerup confirm` within {}s or the change reverts",
                pending.remaining().as_secs()
            );
            Ok(())
        }

        Command::Snapshot { .. } => {
            let snapshot = snapshot_state(&config, &cli.config)?;
            println!("{}", snapshot.name);
            Ok(())
        }

        Command::Relay { command } => {
            let _lock = FileLock::acquire(&config_dir)?;
            match command {
                RelayCommand::Add { address } => {
                    // Vet the address before it lands in the file.
                    RelayDescriptor::parse(&address)?;
                    if edit::add_relay_address(&cli.config, &address)? {
                        println!("relay added");
                    } else {
                        println!("relay already configured");
                    }
                    Ok(())
                }
                RelayCommand::Remove { address } => {
                    edit::remove_relay_address(&cli.config, &address)?;
                    println!("relay removed");
                    Ok(())
                }
            }
        }

        Command::Stop => call(&socket, Request::Stop).await,
    }
}

/// Accept a pending commit-confirmed. Prefers the admin api so a running
/// daemon also cancels its enforcer; falls back to the file protocol, and
/// never requires the (possibly mid-change) config to parse.
async fn confirm(config_path: &std::path::Path) -> Result<()> {
    if let Ok(config) = Config::load(config_path) {
        let socket = config.admin_socket_in(&peerup::config_dir_of(config_path));
        if let Ok(response) = api::call(&socket, Request::Confirm).await {
            return print_response(response);
        }
    }

    lifecycle::confirm(config_path)?;
    println!("confirmed");
    Ok(())
}

/// The daemon-less fallback: build a short-lived node with the same core
/// and ping through it. Gated behind `admin.allow-direct`.
async fn direct_ping(config: Config, config_path: PathBuf, target: &str) -> Result<()> {
    let config_dir = peerup::config_dir_of(&config_path);
    let node = peerup::Node::bring_up(
        &config,
        &config_dir,
        peerup::NodeOptions {
            grace: peerup::relay::INVITE_GRACE,
            namespace: None,
            extra_relays: Vec::new(),
        },
    )
    .await?;

    let peer = node.discovery.resolve_target(target)?;
    let rtt = peerup::pingpong::ping(
        &node.handle,
        &node.discovery,
        peer,
        &config.protocols.ping_pong.id,
    )
    .await?;

    println!("{}: {:.1} ms", short_peer(&peer), rtt.as_secs_f64() * 1000.0);
    node.shutdown.cancel();
    Ok(())
}

fn parse_peer(value: &str) -> Result<PeerId> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid peer id: {value}"))
}

fn hint_reload() {
    println!("# a running daemon picks this up on SIGHUP");
}

fn snapshot_state(config: &Config, config_path: &std::path::Path) -> Result<snapshot::Snapshot> {
    let config_dir = peerup::config_dir_of(config_path);

    let mut files = Vec::new();
    if let Some(name) = config_path.file_name() {
        files.push(name.to_string_lossy().into_owned());
    }
    if let Some(path) = config.authorized_keys_file_in(&config_dir) {
        if let Some(name) = path.file_name() {
            files.push(name.to_string_lossy().into_owned());
        }
    }

    snapshot::create(&config_dir, &files)
}

async fn call(socket: &std::path::Path, request: Request) -> Result<()> {
    print_response(api::call(socket, request).await?)
}

fn expect_ok(response: api::Response) -> Result<api::Response> {
    if response.ok {
        Ok(response)
    } else {
        bail!(
            "{}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

fn print_response(response: api::Response) -> Result<()> {
    let response = expect_ok(response)?;
    if !response.data.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.data)?);
    }
    Ok(())
}
