use clap::Parser;
use color_eyre::eyre::Result;
use orb_cellular_hal::{
    daemon, logging, profile::DeleteInUsePolicy, session::IpPreference,
    telemetry::RatSet, transport::mmcli::ModemManagerCli, CellularHal, Config,
};
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{debug, info, warn};

const SYSLOG_IDENTIFIER: &str = "worldcoin-cellulard";

/// Brings the cellular modem online and keeps a data session up.
#[derive(Parser, Debug)]
#[clap(about)]
struct Args {
    /// Upper bound for a single modem command, in seconds.
    #[arg(long, env = "CELLULAR_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    command_timeout: u64,

    /// SIM slot to use when its card is usable. Defaults to the first usable
    /// slot.
    #[arg(long, env = "CELLULAR_PREFERRED_SLOT")]
    preferred_slot: Option<u32>,

    #[arg(long, env = "CELLULAR_IP_PREFERENCE", value_enum, default_value_t)]
    ip_preference: IpPreference,

    /// Comma separated radio technologies, e.g. `UMTS,LTE`.
    #[arg(long, env = "CELLULAR_PREFERRED_RAT")]
    preferred_rat: Option<RatSet>,

    /// What deleting a profile with a running session does.
    #[arg(long, env = "CELLULAR_DELETE_IN_USE", value_enum, default_value_t)]
    delete_in_use: DeleteInUsePolicy,

    /// How often ModemManager is polled for changes, in seconds.
    #[arg(long, env = "CELLULAR_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    logging::try_init(SYSLOG_IDENTIFIER)?;

    let args = Args::parse();
    debug!(?args, "starting cellulard");

    let result = async {
        let poll = Duration::from_secs(args.poll_interval);
        let command_timeout = Duration::from_secs(args.command_timeout);

        let config = Config::builder()
            .command_timeout(command_timeout)
            .ip_preference(args.ip_preference)
            .delete_in_use(args.delete_in_use)
            .maybe_preferred_slot(args.preferred_slot)
            .maybe_preferred_rat(args.preferred_rat)
            .build();

        let transport = ModemManagerCli::builder()
            .poll_interval(poll)
            .connect_timeout(command_timeout)
            .spawn();

        let hal = CellularHal::spawn(transport, config);

        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigint = unix::signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => warn!("received SIGTERM"),
            _ = sigint.recv()  => warn!("received SIGINT"),
            _ = daemon::supervise().hal(&hal).poll(poll).run() => {}
        }

        info!("closing modem and exiting gracefully");

        hal.shutdown().await
    }
    .await;

    logging::flush();

    result
}
