//! Beeforward CLI - run the forwarding wallet
//!
//!   beeforward                      → load (or create) testnet.wallet, forward once
//!   beeforward my.wallet -loop      → forward on every confirmed incoming payment
//!   beeforward -new                 → fresh wallet named <millis>.wallet
//!
//! Prints the wallet's short info at start, the balance every interval and
//! a line per wallet transaction. `--json` switches stdout to JSON lines.
//! Logs go to stderr (`RUST_LOG`, `FORWARDER_LOG_JSON=1`).

use anyhow::{anyhow, Context};
use beeforward::logging::init_logging;
use beeforward::wallet::{Activity, BalanceReport, ShortInfo, TxInfo};
use beeforward::{
    install_signal_handlers, ChainClient, ForwardPolicy, KeyStore, MemoryChain, Network, ServiceConfig, Shutdown,
    WalletService,
};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

fn main() {
    init_logging();
    #[cfg(feature = "electrum")]
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args: Vec<String> = env::args().collect();
    let opts = match ParsedArgs::parse(&args[1..]) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run `beeforward --help` for usage.");
            std::process::exit(2);
        }
    };

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("beeforward {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run(opts) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

#[derive(Default)]
struct ParsedArgs {
    wallet: Option<String>,
    new_wallet: bool,
    looping: bool,
    network: Option<String>,
    electrum_url: Option<String>,
    to: Option<String>,
    amount: Option<u64>,
    fee_multiplier: Option<u64>,
    depth: Option<u32>,
    sync_timeout: Option<u64>,
    balance_interval: Option<u64>,
    json: bool,
    offline: bool,
    help: bool,
    version: bool,
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1).map(|s| s.as_str()).ok_or_else(|| format!("{} needs a value", flag))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, String> {
    raw.trim().parse().map_err(|_| format!("{}: not a number: {}", flag, raw))
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Result<Self, String> {
        // Load .env file if present
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    if !value.is_empty() && env::var(key.trim()).is_err() {
                        env::set_var(key.trim(), value);
                    }
                }
            }
        }

        let mut opts = ParsedArgs::default();
        let mut i = 0;

        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "-new" | "--new" => opts.new_wallet = true,
                "-loop" | "--loop" => opts.looping = true,
                "--json" => opts.json = true,
                "--offline" => opts.offline = true,
                "--network" | "-n" => {
                    opts.network = Some(value(args, i, arg)?.to_string());
                    i += 1;
                }
                "--electrum" | "-e" => {
                    opts.electrum_url = Some(value(args, i, arg)?.to_string());
                    i += 1;
                }
                "--to" => {
                    opts.to = Some(value(args, i, arg)?.to_string());
                    i += 1;
                }
                "--amount" => {
                    opts.amount = Some(number(value(args, i, arg)?, arg)?);
                    i += 1;
                }
                "--fee-multiplier" => {
                    opts.fee_multiplier = Some(number(value(args, i, arg)?, arg)?);
                    i += 1;
                }
                "--depth" => {
                    opts.depth = Some(number(value(args, i, arg)?, arg)?);
                    i += 1;
                }
                "--sync-timeout" => {
                    opts.sync_timeout = Some(number(value(args, i, arg)?, arg)?);
                    i += 1;
                }
                "--balance-interval" => {
                    opts.balance_interval = Some(number(value(args, i, arg)?, arg)?);
                    i += 1;
                }
                _ if !arg.starts_with('-') => {
                    if opts.wallet.is_some() {
                        return Err(format!("unexpected argument: {}", arg));
                    }
                    opts.wallet = Some(arg.to_string());
                }
                _ => return Err(format!("unknown option: {}", arg)),
            }
            i += 1;
        }

        // Apply environment variables (lower priority than CLI args)
        if opts.network.is_none() {
            opts.network = env::var("FORWARDER_NETWORK").ok().filter(|s| !s.is_empty());
        }
        if opts.electrum_url.is_none() {
            opts.electrum_url = env::var("FORWARDER_ELECTRUM").ok().filter(|s| !s.is_empty());
        }
        if opts.to.is_none() {
            opts.to = env::var("FORWARDER_TO").ok().filter(|s| !s.is_empty());
        }
        if opts.amount.is_none() {
            if let Ok(raw) = env::var("FORWARDER_AMOUNT") {
                opts.amount = Some(number(&raw, "FORWARDER_AMOUNT")?);
            }
        }

        Ok(opts)
    }

    fn to_config(&self) -> anyhow::Result<ServiceConfig> {
        let network = match self.network.as_deref() {
            Some(raw) => Network::parse(raw).ok_or_else(|| anyhow!("unknown network: {}", raw))?,
            None => Network::default(),
        };

        let mut config = match (&self.wallet, self.new_wallet) {
            (Some(path), new) => ServiceConfig::new(path).with_new_wallet(new),
            (None, true) => ServiceConfig::fresh("."),
            (None, false) => ServiceConfig::new(format!("{}.wallet", network.as_str())),
        }
        .with_network(network)
        .with_policy(ForwardPolicy::from_loop_flag(self.looping));

        if let Some(to) = &self.to {
            config = config.with_destination(to);
        }
        if let Some(amount) = self.amount {
            config = config.with_amount(amount);
        }
        if let Some(multiplier) = self.fee_multiplier {
            config = config.with_fee_multiplier(multiplier);
        }
        if let Some(depth) = self.depth {
            config = config.with_confirmation_depth(depth);
        }
        if let Some(secs) = self.sync_timeout {
            config = config.with_sync_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.balance_interval {
            config = config.with_balance_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(url) = &self.electrum_url {
            config = config.with_electrum(url);
        }
        Ok(config)
    }
}

fn print_usage() {
    println!(
        r#"beeforward - forward received coins to a fixed address

USAGE:
    beeforward [wallet-file] [-new] [-loop] [options]

ARGUMENTS:
    wallet-file             Wallet file (default: <network>.wallet)
    -new                    Create a new wallet (<millis>.wallet unless a file is given)
    -loop                   Forward on every confirmed incoming payment, not just the first

OPTIONS:
    --network, -n <net>     bitcoin|testnet|signet|regtest (env: FORWARDER_NETWORK, default: testnet)
    --electrum, -e <url>    Electrum server URL (env: FORWARDER_ELECTRUM)
    --to <address>          Forwarding destination (env: FORWARDER_TO)
    --amount <sat>          Amount to forward (env: FORWARDER_AMOUNT, default: 546)
    --fee-multiplier <n>    Multiple of the minimum relay fee rate (default: 3)
    --depth <n>             Confirmations before forwarding (default: 1)
    --sync-timeout <secs>   Give up on the initial sync after this long (default: 300)
    --balance-interval <s>  Balance report interval (default: 30)
    --json                  JSON lines on stdout
    --offline               Use the in-memory chain (no network)
    --version, -V           Print version
    --help, -h              Print this help

ENVIRONMENT:
    RUST_LOG                Log filter (default: info)
    FORWARDER_LOG_JSON=1    JSON log lines on stderr

EXAMPLES:
    beeforward
    beeforward -new -loop --to tb1q... --amount 1000
    beeforward regtest.wallet -n regtest -e tcp://127.0.0.1:60401
"#
    );
}

fn run(opts: ParsedArgs) -> anyhow::Result<()> {
    let config = opts.to_config()?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;

    rt.block_on(async {
        let shutdown = install_signal_handlers();
        let out = Output { json: opts.json };

        if opts.offline {
            let chain = Arc::new(MemoryChain::new(config.network));
            return serve(config, chain, shutdown, out).await;
        }

        #[cfg(feature = "electrum")]
        let result = {
            let chain = Arc::new(beeforward::BdkChain::new(
                config.network,
                config.chain_path(),
                config.electrum_url.as_deref(),
                config.poll_interval,
            ));
            serve(config, chain, shutdown, out).await
        };

        #[cfg(not(feature = "electrum"))]
        let result = {
            let _ = (config, shutdown, out);
            Err(anyhow!("built without the `electrum` feature; run with --offline"))
        };

        result
    })
}

async fn serve<C: ChainClient + KeyStore>(
    config: ServiceConfig,
    chain: Arc<C>,
    shutdown: Shutdown,
    out: Output,
) -> anyhow::Result<()> {
    let interval = config.balance_interval;
    let service = WalletService::new(config, chain).context("Invalid configuration")?;
    let mut activity = service.subscribe_activity();

    service.start(&shutdown).await.context("Wallet service failed to start")?;
    out.short_info(&service.short_info()?);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => match service.balance() {
                Ok(balance) => out.balance(&balance),
                Err(e) => debug!("No balance: {}", e),
            },
            event = activity.recv() => match event {
                Ok(event) => out.activity(&service, &event),
                Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "Output lagged behind activity"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    service.stop().await.context("Shutdown failed")?;
    Ok(())
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn line<T: Serialize>(&self, kind: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(data) => println!("{}", json!({ "type": kind, "data": data })),
            Err(e) => warn!("Cannot serialize {}: {}", kind, e),
        }
    }

    fn short_info(&self, info: &ShortInfo) {
        if self.json {
            return self.line("wallet", info);
        }
        println!("Network:         {}", info.network);
        println!("Seed:            {}", info.mnemonic);
        println!("Created:         {}", info.creation_time);
        println!("Receive address: {}", info.receive_address);
    }

    fn balance(&self, balance: &BalanceReport) {
        if self.json {
            return self.line("balance", balance);
        }
        println!(
            "Balance: {} sat available, {} sat estimated ({} confirmed, {} pending)",
            balance.available, balance.estimated, balance.confirmed, balance.pending
        );
    }

    fn tx(&self, info: &TxInfo) {
        if self.json {
            return self.line("transaction", info);
        }
        println!(
            "  tx {} {} value {:+} sat, fee {}, depth {}, {}",
            info.txid,
            info.time.as_deref().unwrap_or("(unconfirmed)"),
            info.value,
            info.fee.map(|f| format!("{} sat", f)).unwrap_or_else(|| "n/a".into()),
            info.confirmations,
            if info.confirmed { "confirmed" } else { "pending" },
        );
    }

    fn activity<C: ChainClient + KeyStore>(&self, service: &WalletService<C>, event: &Activity) {
        if self.json {
            self.line("activity", event);
        } else {
            match event {
                Activity::Seen { txid, direction, required_depth, .. } => {
                    println!("Seen {} transaction {}, waiting for {} confirmation(s)", direction, txid, required_depth)
                }
                Activity::Confirmed { txid, direction, confirmations, .. } => {
                    println!("Confirmed {} transaction {} ({} confirmation(s))", direction, txid, confirmations)
                }
                Activity::Forwarded { txid, destination, amount_sat, fee_sat, persisted } => {
                    println!("Forwarded {} sat to {} in {} (fee {} sat)", amount_sat, destination, txid, fee_sat);
                    if !persisted {
                        println!("  warning: wallet file not saved");
                    }
                }
                Activity::WaitingForFunds { destination, amount_sat, required, available } => println!(
                    "Waiting for funds to forward {} sat to {}: need {} sat, have {} sat",
                    amount_sat, destination, required, available
                ),
                Activity::ForwardSkipped { trigger, reason } => println!("Not forwarding for {}: {}", trigger, reason),
                Activity::ForwardFailed { reason } => println!("Forward failed: {}", reason),
                Activity::Dropped { txid, direction } => {
                    println!("Dropped {} transaction {} before confirmation", direction, txid)
                }
            }
        }

        let txid = match event {
            Activity::Seen { txid, .. } | Activity::Confirmed { txid, .. } => *txid,
            _ => return,
        };
        match service.tx_info(txid) {
            Ok(Some(info)) => self.tx(&info),
            Ok(None) => debug!(%txid, "Transaction not known to the wallet"),
            Err(e) => debug!(%txid, "No transaction info: {}", e),
        }
        if let Ok(balance) = service.balance() {
            self.balance(&balance);
        }
    }
}
