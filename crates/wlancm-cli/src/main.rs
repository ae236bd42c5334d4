//! Command-line simulator for the WLAN connection manager core.
//!
//! Drives scripted scenarios against a loopback firmware and prints the
//! resulting command lifecycle events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{broadcast, oneshot};
use wlancm_commands::CommandEvent;
use wlancm_sme::testing::LoopbackFirmware;
use wlancm_sme::{
    AntennaModeParams, ChannelWidth, CommandTicket, DualMacConfigParams, EventSender,
    FirmwareEvent, MacAddr, MacContext, NextAction, NssUpdateParams, RoamInvokeParams,
    RoamNotification, RoamState, RsoCommand, SetHwModeParams, SmeConfig, SmeNotifier, SmeRuntime,
    TwtNudgeParams, TwtResumeParams, TwtSetupParams, TwtTarget, TwtTeardown, UpdateReason,
    VdevId, VdevRole, event_channel,
};

const STA_VDEV: VdevId = 0;

/// How long a scenario step may wait for its callback.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// WLAN connection manager simulator.
#[derive(Parser, Debug)]
#[command(name = "wlancm")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML). Environment overrides still apply.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted scenario against the loopback firmware.
    Simulate {
        #[arg(short, long, value_enum)]
        scenario: Scenario,
        /// Access point the station starts associated with.
        #[arg(long, default_value = "02:aa:00:00:00:01")]
        bssid: MacAddr,
        /// Print lifecycle events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration.
    ShowConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// TWT setup, suspend, resume, nudge, statistics and teardown
    Twt,
    /// Hardware mode, dual-MAC, NSS and antenna mode changes
    HwMode,
    /// Roam offload, host-triggered roam and roam synch
    Roam,
}

/// Notifier that reports upper-layer notifications on the log.
struct LogNotifier;

impl SmeNotifier for LogNotifier {
    fn on_twt_teardown(&self, teardown: TwtTeardown) {
        tracing::info!(
            "TWT teardown vdev={} peer={} dialog={} reason={:?}",
            teardown.vdev_id,
            teardown.peer,
            teardown.dialog_id,
            teardown.reason
        );
    }

    fn on_roam_synch(&self, vdev_id: VdevId, bssid: MacAddr) {
        tracing::info!("Roamed vdev={} to {}", vdev_id, bssid);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = match &args.config {
        Some(path) => SmeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SmeConfig::from_env(),
    };

    match args.command {
        Command::Simulate {
            scenario,
            bssid,
            json,
        } => simulate(config, scenario, bssid, json).await,
        Command::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging() {
    let json_logging = std::env::var("WLANCM_LOG_JSON")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wlancm=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn simulate(config: SmeConfig, scenario: Scenario, bssid: MacAddr, json: bool) -> Result<()> {
    let (sender, receiver) = event_channel();
    let ctx = MacContext::builder(config, LoopbackFirmware::new(sender.clone()))
        .notifier(Arc::new(LogNotifier))
        .open()?;
    let mut lifecycle = ctx.events().subscribe();
    let runtime = SmeRuntime::start(ctx.clone(), receiver);

    ctx.add_vdev(STA_VDEV, VdevRole::Sta)?;
    ctx.vdev_connected(STA_VDEV, bssid)?;

    let outcome = match scenario {
        Scenario::Twt => run_twt(&ctx, bssid).await,
        Scenario::HwMode => run_hw_mode(&ctx).await,
        Scenario::Roam => run_roam(&ctx, &sender, bssid).await,
    };

    runtime.stop().await;
    print_events(&mut lifecycle, json)?;
    outcome?;

    let stats = ctx.queue_stats();
    println!(
        "submitted={} completed={} cancelled={} timed_out={} free={}/{}",
        stats.submitted, stats.completed, stats.cancelled, stats.timed_out, stats.free,
        stats.capacity
    );
    ctx.audit()?;
    ctx.close();
    Ok(())
}

/// Issue one request and wait for its completion callback.
async fn step<T, F>(name: &str, issue: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Box<dyn FnOnce(T) + Send>) -> wlancm_sme::Result<CommandTicket>,
{
    let (tx, rx) = oneshot::channel();
    let ticket = issue(Box::new(move |result| {
        let _ = tx.send(result);
    }))
    .with_context(|| format!("{} rejected", name))?;
    tracing::debug!("{} admitted as {}", name, ticket);

    tokio::time::timeout(STEP_TIMEOUT, rx)
        .await
        .with_context(|| format!("{} timed out", name))?
        .with_context(|| format!("{} dropped its callback", name))
}

async fn run_hw_mode(ctx: &Arc<MacContext>) -> Result<()> {
    let hw = step("set_hw_mode", |cb| {
        ctx.set_hw_mode(
            SetHwModeParams {
                hw_mode_index: 1,
                session_id: Some(STA_VDEV),
                reason: UpdateReason(1),
                next_action: NextAction::NONE,
                request_id: 1,
            },
            cb,
        )
    })
    .await?;
    println!("set_hw_mode -> {:?} (mode {})", hw.status, hw.cfgd_hw_mode_index);

    let dual = step("dual_mac_config", |cb| {
        ctx.dual_mac_config(
            DualMacConfigParams {
                scan_config: 1,
                fw_mode_config: 1,
            },
            cb,
        )
    })
    .await?;
    println!("dual_mac_config -> {:?}", dual.status);

    let nss = step("nss_update", |cb| {
        ctx.nss_update_request(
            NssUpdateParams {
                vdev_id: STA_VDEV,
                new_nss: 1,
                ch_width: ChannelWidth::Mhz80,
                next_action: NextAction::NONE,
                reason: UpdateReason(2),
                original_vdev_id: STA_VDEV,
                request_id: 2,
            },
            cb,
        )
    })
    .await?;
    println!("nss_update -> {:?} (nss {})", nss.status, nss.new_nss);

    let antenna = step("antenna_mode", |cb| {
        ctx.antenna_mode(
            AntennaModeParams {
                num_tx_chains: 1,
                num_rx_chains: 1,
            },
            cb,
        )
    })
    .await?;
    println!("antenna_mode -> {:?}", antenna.status);
    Ok(())
}

async fn run_twt(ctx: &Arc<MacContext>, bssid: MacAddr) -> Result<()> {
    let target = TwtTarget::unicast(STA_VDEV, bssid, 1);

    let setup = step("twt setup", |cb| {
        ctx.add_dialog(target, TwtSetupParams::default(), cb)
    })
    .await?;
    println!("setup -> {:?}", setup.status);

    let suspend = step("twt suspend", |cb| ctx.pause_dialog(target, cb)).await?;
    println!("suspend -> {:?}", suspend.status);

    let resume = step("twt resume", |cb| {
        ctx.resume_dialog(target, TwtResumeParams::default(), cb)
    })
    .await?;
    println!("resume -> {:?}", resume.status);

    let nudge = step("twt nudge", |cb| {
        ctx.nudge_dialog(
            target,
            TwtNudgeParams {
                wake_time_us: 2_048,
                next_twt_size: 0,
                sp_start_offset_us: 0,
            },
            cb,
        )
    })
    .await?;
    println!("nudge -> {:?}", nudge.status);

    let stats = step("twt stats", |cb| ctx.twt_get_stats(target, cb)).await?;
    println!("get_stats -> {:?} {:?}", stats.status, stats.detail);

    let teardown = step("twt teardown", |cb| ctx.del_dialog(target, cb)).await?;
    println!("teardown -> {:?}", teardown.status);

    for (peer, session) in ctx.twt_sessions(STA_VDEV) {
        println!("session {} dialog {} -> {:?}", peer, session.dialog_id, session.state);
    }
    Ok(())
}

async fn run_roam(ctx: &Arc<MacContext>, firmware: &EventSender, bssid: MacAddr) -> Result<()> {
    let mut next = bssid.octets();
    next[5] = next[5].wrapping_add(1);
    let next = MacAddr(next);

    let start = step("rso start", |cb| {
        ctx.roam_offload(STA_VDEV, RsoCommand::Start, cb)
    })
    .await?;
    println!("rso start -> success={}", start.success);

    let invoke = step("roam invoke", |cb| {
        ctx.roam_invoke(
            RoamInvokeParams {
                vdev_id: STA_VDEV,
                bssid: next,
                channel_freq: 5180,
                forced: false,
            },
            cb,
        )
    })
    .await?;
    println!("roam invoke -> success={}", invoke.success);

    // Firmware completes the roam on its own
    firmware.deliver(FirmwareEvent::Roam(RoamNotification::Synch {
        vdev_id: STA_VDEV,
        bssid: next,
    }));
    wait_for_roam_state(ctx, RoamState::Idle).await?;

    let current = ctx
        .vdev(STA_VDEV)
        .and_then(|v| v.bssid)
        .context("station lost its association")?;
    println!("associated with {}", current);

    let stop = step("rso stop", |cb| {
        ctx.roam_offload(STA_VDEV, RsoCommand::Stop, cb)
    })
    .await?;
    println!("rso stop -> success={}", stop.success);
    Ok(())
}

async fn wait_for_roam_state(ctx: &Arc<MacContext>, want: RoamState) -> Result<()> {
    let poll = async {
        loop {
            if ctx.roam_state(STA_VDEV).map(|r| r.state) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(STEP_TIMEOUT, poll)
        .await
        .with_context(|| format!("roam state never reached {:?}", want))
}

fn print_events(rx: &mut broadcast::Receiver<CommandEvent>, json: bool) -> Result<()> {
    loop {
        match rx.try_recv() {
            Ok(event) if json => println!("{}", serde_json::to_string(&event)?),
            Ok(event) => println!("{}", describe(&event)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!("Lost {} lifecycle events", n);
            }
            Err(_) => return Ok(()),
        }
    }
}

fn describe(event: &CommandEvent) -> String {
    let mut line = format!(
        "{} {:<10} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        format!("{:?}", event.event_type),
        event.kind
    );
    if let Some(sequence) = event.sequence {
        line.push_str(&format!(" seq={}", sequence));
    }
    if let Some(vdev_id) = event.vdev_id {
        line.push_str(&format!(" vdev={}", vdev_id));
    }
    line
}
