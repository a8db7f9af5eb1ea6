use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;
use twinleg_core::{
    Amount, Clock, Custodian, CustodyError, EngineConfig, GlobalConfig, Ledger, LedgerEngine,
    LedgerError, LedgerSnapshot, ManualClock, Plan, Registration, SystemClock, TransferReceipt,
};

mod auth;

use auth::{identity_of, parse_sk_hex, Command, Journal, VerificationError};

#[derive(Parser)]
#[command(version, about = "Binary referral ledger: placement, leg volume and reward cycles")]
struct Cli {
    /// Path to the ledger state file.
    #[arg(long, env = "TWINLEG_STATE", default_value = "twinleg-state.json", global = true)]
    state: PathBuf,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a fresh state file.
    Init {
        /// Owner identity (hex ed25519 public key).
        #[arg(long)]
        owner: String,
        /// Admin identity (hex ed25519 public key).
        #[arg(long)]
        admin: String,
        /// Reward cycle length in seconds. Defaults to the engine config.
        #[arg(long)]
        cycle_secs: Option<u64>,
        /// JSON engine config (rates, caps, depth limits).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing state file.
        #[arg(long)]
        force: bool,
    },
    /// Generate an ed25519 key pair; the public key is the ledger identity.
    Keygen {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Register the signer under a referrer.
    Register {
        #[command(flatten)]
        signer: SignerArgs,
        #[arg(long, value_enum, default_value_t = PlanArg::Binary)]
        plan: PlanArg,
        /// Sponsor identity. Omit to join under the root.
        #[arg(long)]
        referrer: Option<String>,
        /// Contributed volume. Defaults to the registration stake.
        #[arg(long)]
        volume: Option<Amount>,
    },
    /// Change the minimum interval between distributions (owner/admin).
    ChangeCycle {
        #[command(flatten)]
        signer: SignerArgs,
        #[arg(long)]
        secs: u64,
    },
    /// Set the broadcast message (owner).
    Message {
        #[command(flatten)]
        signer: SignerArgs,
        #[arg(long)]
        text: String,
    },
    /// Run a reward distribution (owner).
    Distribute {
        #[command(flatten)]
        signer: SignerArgs,
    },
    /// Authorize an emergency withdrawal to the owner (owner/admin).
    EmergencyWithdraw {
        #[command(flatten)]
        signer: SignerArgs,
        /// Amount to withdraw; everything when omitted.
        #[arg(long)]
        amount: Option<Amount>,
    },
    /// Exclude a participant from future distributions (owner/admin).
    Deactivate {
        #[command(flatten)]
        signer: SignerArgs,
        #[arg(long)]
        id: String,
    },
    /// Print every participant in registration order.
    List,
    /// Print one participant.
    Get {
        #[arg(long)]
        id: String,
    },
    ShowMessage,
    ShowCycle,
    /// Print the audit log.
    Events,
    /// Check journal signatures and replay it against the stored state.
    VerifyJournal,
}

#[derive(Args)]
struct SignerArgs {
    /// Caller's 32-byte ed25519 secret key in hex.
    #[arg(long = "sk-hex", env = "TWINLEG_SK_HEX", hide_env_values = true)]
    sk_hex: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlanArg {
    Binary,
    InOrder,
}

impl From<PlanArg> for Plan {
    fn from(plan: PlanArg) -> Self {
        match plan {
            PlanArg::Binary => Plan::Binary,
            PlanArg::InOrder => Plan::InOrder,
        }
    }
}

//==================== state file ====================//

#[derive(Serialize, Deserialize)]
struct StateFile {
    /// Ledger as created by `init`; the journal replays on top of it.
    genesis: LedgerSnapshot,
    ledger: LedgerSnapshot,
    journal: Journal,
}

impl StateFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("read state {} (run `twinleg init` first)", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse state {}", path.display()))
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(&json))
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    fn engine(&self) -> anyhow::Result<LedgerEngine> {
        Ok(LedgerEngine::from_snapshot(self.ledger.clone())?)
    }
}

/// Stand-in for the external custodian when the CLI runs offline: it
/// acknowledges every request with a deterministic reference so journal
/// replays reproduce the same audit log.
struct OfflineCustodian;

impl Custodian for OfflineCustodian {
    fn approve_stake(&self, from: &str, amount: Amount) -> Result<TransferReceipt, CustodyError> {
        info!(from, amount, "stake approval acknowledged");
        Ok(TransferReceipt {
            reference: format!("stake:{from}:{amount}"),
            amount: Some(amount),
        })
    }

    fn emergency_withdraw(
        &self,
        to: &str,
        amount: Option<Amount>,
    ) -> Result<TransferReceipt, CustodyError> {
        let label = amount.map_or_else(|| "all".to_string(), |a| a.to_string());
        info!(to, amount = %label, "withdrawal handed to custodian");
        Ok(TransferReceipt {
            reference: format!("withdraw:{to}:{label}"),
            amount,
        })
    }
}

type CliLedger = Ledger<OfflineCustodian, ManualClock>;

fn apply(
    ledger: &CliLedger,
    caller: &str,
    command: &Command,
) -> Result<serde_json::Value, LedgerError> {
    let value = match command {
        Command::Register {
            plan,
            referrer,
            volume,
        } => {
            let mut request = Registration::new(caller, *plan);
            request.referrer = referrer.clone();
            request.volume = *volume;
            json!(ledger.register(caller, request)?)
        }
        Command::ChangeRewardCycle { secs } => {
            ledger.change_reward_cycle(caller, *secs)?;
            json!({ "reward_cycle_duration": secs })
        }
        Command::SendMessage { text } => {
            ledger.send_message(caller, text.clone())?;
            json!({ "owner_message": text })
        }
        Command::Distribute => json!(ledger.distribute(caller)?),
        Command::EmergencyWithdraw { amount } => json!(ledger.emergency_withdraw(caller, *amount)?),
        Command::Deactivate { participant } => {
            ledger.deactivate(caller, participant)?;
            json!({ "deactivated": participant })
        }
    };
    Ok(value)
}

fn run_signed(state_path: &Path, signer: &SignerArgs, command: Command) -> anyhow::Result<()> {
    let mut state = StateFile::load(state_path)?;
    let key = parse_sk_hex(&signer.sk_hex).map_err(anyhow::Error::msg)?;
    let caller = identity_of(&key.verifying_key());
    // Never let a skewed system clock run the ledger backwards.
    let at = SystemClock.now().max(state.ledger.meta.timestamp);
    let ledger = Ledger::new(state.engine()?, OfflineCustodian, ManualClock::new(at));
    let height = state.ledger.meta.height;

    let outcome = apply(&ledger, &caller, &command);
    let snapshot = ledger.snapshot();
    if snapshot.meta.height != height {
        state.journal.append(&key, at, command);
        state.ledger = snapshot;
        state.save(state_path)?;
    }
    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn init_cmd(
    state_path: &Path,
    owner: String,
    admin: String,
    cycle_secs: Option<u64>,
    config: Option<&Path>,
    force: bool,
) -> anyhow::Result<()> {
    if state_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", state_path.display());
    }
    for id in [&owner, &admin] {
        auth::parse_identity(id)
            .map_err(|e| anyhow::anyhow!("identity {id} is not an ed25519 public key: {e}"))?;
    }
    let engine_config = match config {
        Some(path) => {
            let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_slice::<EngineConfig>(&bytes)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    let duration = cycle_secs.unwrap_or(engine_config.default_reward_cycle);
    let global = GlobalConfig::new(owner, admin, duration, SystemClock.now())?;
    let engine = LedgerEngine::new(engine_config, global)?;
    let genesis = engine.snapshot();
    StateFile {
        genesis: genesis.clone(),
        ledger: genesis,
        journal: Journal::default(),
    }
    .save(state_path)?;
    info!(state = %state_path.display(), "ledger initialized");
    println!("ledger initialized → {}", state_path.display());
    Ok(())
}

fn keygen_cmd(out_dir: Option<&Path>) -> anyhow::Result<()> {
    let sk = SigningKey::generate(&mut OsRng);
    let sk_hex = hex::encode(sk.to_bytes());
    let id = identity_of(&sk.verifying_key());
    match out_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
            fs::write(dir.join("sk.hex"), &sk_hex)?;
            fs::write(dir.join("pk.hex"), &id)?;
            println!("keypair written → {}", dir.display());
            println!("identity: {id}");
        }
        None => println!("{}", json!({ "identity": id, "sk_hex": sk_hex })),
    }
    Ok(())
}

fn verify_journal_cmd(state_path: &Path) -> anyhow::Result<()> {
    let state = StateFile::load(state_path)?;
    state.journal.verify()?;
    let stored = state.engine()?;
    let ledger = Ledger::new(
        LedgerEngine::from_snapshot(state.genesis.clone())?,
        OfflineCustodian,
        ManualClock::new(0),
    );
    for entry in &state.journal.entries {
        ledger.clock().set(entry.at);
        // Rejected commands are never journaled, but a replay must not stop
        // on one if the engine rules tightened since.
        if let Err(err) = apply(&ledger, &entry.caller, &entry.command) {
            tracing::warn!(seq = entry.seq, %err, "journal entry rejected on replay");
        }
    }
    let replayed = ledger.snapshot().state_root;
    if replayed != stored.state_root() {
        return Err(VerificationError::RootMismatch {
            stored: hex::encode(stored.state_root()),
            replayed: hex::encode(replayed),
        }
        .into());
    }
    println!(
        "journal ok: {} entries, state root {}",
        state.journal.entries.len(),
        hex::encode(replayed)
    );
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let state = cli.state.as_path();
    match cli.command {
        Cmd::Init {
            owner,
            admin,
            cycle_secs,
            config,
            force,
        } => init_cmd(state, owner, admin, cycle_secs, config.as_deref(), force),
        Cmd::Keygen { out_dir } => keygen_cmd(out_dir.as_deref()),
        Cmd::Register {
            signer,
            plan,
            referrer,
            volume,
        } => run_signed(
            state,
            &signer,
            Command::Register {
                plan: plan.into(),
                referrer,
                volume,
            },
        ),
        Cmd::ChangeCycle { signer, secs } => {
            run_signed(state, &signer, Command::ChangeRewardCycle { secs })
        }
        Cmd::Message { signer, text } => run_signed(state, &signer, Command::SendMessage { text }),
        Cmd::Distribute { signer } => run_signed(state, &signer, Command::Distribute),
        Cmd::EmergencyWithdraw { signer, amount } => {
            run_signed(state, &signer, Command::EmergencyWithdraw { amount })
        }
        Cmd::Deactivate { signer, id } => {
            run_signed(state, &signer, Command::Deactivate { participant: id })
        }
        Cmd::List => {
            let engine = StateFile::load(state)?.engine()?;
            println!("{}", serde_json::to_string_pretty(&engine.list_all())?);
            Ok(())
        }
        Cmd::Get { id } => {
            let engine = StateFile::load(state)?.engine()?;
            println!("{}", serde_json::to_string_pretty(&engine.get(&id))?);
            Ok(())
        }
        Cmd::ShowMessage => {
            let engine = StateFile::load(state)?.engine()?;
            println!("{}", json!({ "owner_message": engine.owner_message() }));
            Ok(())
        }
        Cmd::ShowCycle => {
            let engine = StateFile::load(state)?.engine()?;
            let global = engine.global_config();
            let now = SystemClock.now();
            let value = json!({
                "reward_cycle_duration": global.reward_cycle_duration(),
                "last_distribution_at": global.last_distribution_at(),
                "can_distribute": engine.can_distribute(now),
                "remaining": global.cycle.remaining(now),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Cmd::Events => {
            let engine = StateFile::load(state)?.engine()?;
            println!("{}", serde_json::to_string_pretty(engine.events())?);
            Ok(())
        }
        Cmd::VerifyJournal => verify_journal_cmd(state),
    }
}

fn main() {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> (SigningKey, String) {
        let sk = SigningKey::generate(&mut OsRng);
        let id = identity_of(&sk.verifying_key());
        (sk, id)
    }

    fn temp_state(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("twinleg-{name}-{}.json", std::process::id()))
    }

    fn signer(sk: &SigningKey) -> SignerArgs {
        SignerArgs {
            sk_hex: hex::encode(sk.to_bytes()),
        }
    }

    #[test]
    fn signed_commands_are_journaled_and_replayable() {
        let path = temp_state("replay");
        let (owner_sk, owner) = key();
        let (_, admin) = key();
        let (alice_sk, alice) = key();
        init_cmd(&path, owner.clone(), admin, Some(60), None, true).unwrap();

        let register = Command::Register {
            plan: Plan::Binary,
            referrer: None,
            volume: None,
        };
        run_signed(&path, &signer(&owner_sk), register.clone()).unwrap();
        run_signed(&path, &signer(&alice_sk), register).unwrap();
        run_signed(
            &path,
            &signer(&owner_sk),
            Command::SendMessage {
                text: "hello".into(),
            },
        )
        .unwrap();

        let state = StateFile::load(&path).unwrap();
        assert_eq!(state.journal.entries.len(), 3);
        let engine = state.engine().unwrap();
        assert_eq!(engine.owner_message(), "hello");
        assert_eq!(engine.get(&alice).unwrap().referrer.as_deref(), Some(owner.as_str()));
        verify_journal_cmd(&path).unwrap();
        fs::remove_file(&path).ok();
    }

    #[test]
    fn rejected_commands_leave_state_and_journal_untouched() {
        let path = temp_state("reject");
        let (_, owner) = key();
        let (admin_sk, admin) = key();
        init_cmd(&path, owner, admin, Some(60), None, true).unwrap();
        let before = fs::read(&path).unwrap();
        let err = run_signed(&path, &signer(&admin_sk), Command::Distribute).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Unauthorized { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), before);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let path = temp_state("clobber");
        let (_, owner) = key();
        let (_, admin) = key();
        init_cmd(&path, owner.clone(), admin.clone(), None, None, true).unwrap();
        assert!(init_cmd(&path, owner, admin, None, None, false).is_err());
        fs::remove_file(&path).ok();
    }
}
