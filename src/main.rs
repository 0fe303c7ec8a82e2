use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use stakequiz::logging::{init_logging, LoggingConfig};
use stakequiz::oracle::RelayStats;
use stakequiz::protocol::{short_hex, OPTIONS_PER_QUESTION};
use stakequiz::session::EngineStats;
use stakequiz::{
    AnswerOption, Error, LocalComputeOracle, LocalRandomnessOracle, OracleRelay, ParticipantId,
    QuizConfig, QuizEngine, QuizTokens, Result, SessionEvent, SessionPhase, SystemClock, Topic,
    TokenLedger, VAULT_ADDRESS,
};

#[derive(Parser)]
#[command(name = "stakequiz")]
#[command(about = "Staked trivia sessions against randomness and compute oracles")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); falls back to STAKEQUIZ_CONFIG, then defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent sessions end to end against in-process oracles
    Simulate {
        #[arg(short, long, default_value = "4")]
        participants: usize,

        /// Stake per participant, smallest unit
        #[arg(short, long, default_value = "100")]
        stake: u64,

        /// Probability of answering a question correctly
        #[arg(short, long, default_value = "0.7")]
        accuracy: f64,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Give up on sessions still open after this long
        #[arg(long, default_value = "30s", value_parser = humantime_serde::re::humantime::parse_duration)]
        deadline: Duration,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Debug, Serialize)]
struct ParticipantResult {
    participant: String,
    correct: u8,
    total: u8,
    reward: u64,
    retained: u64,
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    participants: Vec<ParticipantResult>,
    unfinished: usize,
    vault_balance: u64,
    engine: EngineStats,
    relay: RelayStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LoggingConfig::verbose(cli.verbose))?;

    let config = match &cli.config {
        Some(path) => {
            let mut config = QuizConfig::load_from_file(path)?;
            config.override_from_env()?;
            config.validate()?;
            config
        }
        None => QuizConfig::load()?,
    };

    match cli.command {
        Commands::Simulate {
            participants,
            stake,
            accuracy,
            seed,
            deadline,
            json,
        } => {
            if !(0.0..=1.0).contains(&accuracy) {
                return Err(Error::Config(format!(
                    "accuracy {} outside 0.0..=1.0",
                    accuracy
                )));
            }
            let summary = simulate(config, participants, stake, accuracy, seed, deadline).await?;
            print_summary(&summary, json)?;
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn participant_id(index: usize) -> ParticipantId {
    let mut hasher = Sha256::new();
    hasher.update(b"STAKEQUIZ_SIM_PARTICIPANT");
    hasher.update((index as u64).to_be_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    id
}

async fn simulate(
    config: QuizConfig,
    participants: usize,
    stake: u64,
    accuracy: f64,
    seed: u64,
    deadline: Duration,
) -> Result<SimulationSummary> {
    let ledger = Arc::new(TokenLedger::new());
    let randomness = Arc::new(LocalRandomnessOracle::from_seed(seed, 5));
    let compute = Arc::new(LocalComputeOracle::new(5));
    let engine = Arc::new(QuizEngine::new(
        config,
        randomness.clone(),
        compute.clone(),
        ledger.clone(),
        Arc::new(SystemClock),
    )?);
    let relay = Arc::new(OracleRelay::new(
        engine.clone(),
        randomness,
        compute,
        Duration::from_millis(2),
    ));

    let mut events = engine.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run(shutdown_rx).await })
    };

    let preference_count = engine.config().session.min_topic_preferences;
    let mut players = Vec::with_capacity(participants);
    for index in 0..participants {
        let participant = participant_id(index);
        ledger.mint(participant, QuizTokens::new(stake))?;
        ledger.approve(participant, VAULT_ADDRESS, QuizTokens::new(stake));

        // Each participant names a different window of the vocabulary
        let preferences: Vec<Topic> = (0..preference_count)
            .map(|k| Topic::ALL[(index + k) % Topic::ALL.len()])
            .collect();

        let engine = engine.clone();
        let rng = ChaCha20Rng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9));
        players.push(tokio::spawn(async move {
            play(engine, participant, preferences, QuizTokens::new(stake), accuracy, rng, deadline)
                .await
        }));
    }

    let mut unfinished = 0;
    for player in players {
        match player.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => unfinished += 1,
            Ok(Err(e)) => {
                warn!(error = %e, "participant failed");
                unfinished += 1;
            }
            Err(e) => {
                warn!(error = %e, "participant task panicked");
                unfinished += 1;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let relay_stats = relay_task.await.unwrap_or_else(|_| relay.stats());

    let mut results = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Settled {
                participant,
                correct_count,
                total_questions,
                reward,
                retained,
                ..
            }) => results.push(ParticipantResult {
                participant: short_hex(&participant),
                correct: correct_count,
                total: total_questions,
                reward: reward.amount(),
                retained: retained.amount(),
            }),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(_) => break,
        }
    }

    Ok(SimulationSummary {
        participants: results,
        unfinished,
        vault_balance: ledger.vault_balance().amount(),
        engine: engine.stats(),
        relay: relay_stats,
    })
}

/// One participant's side of a session. Returns false when the session was
/// still open at the deadline.
async fn play(
    engine: Arc<QuizEngine>,
    participant: ParticipantId,
    preferences: Vec<Topic>,
    stake: QuizTokens,
    accuracy: f64,
    mut rng: ChaCha20Rng,
    deadline: Duration,
) -> Result<bool> {
    engine.start(participant, &preferences, stake)?;
    let started = Instant::now();
    let mut answered: Option<u8> = None;

    loop {
        let session = match engine.session(&participant) {
            Some(session) => session,
            None => return Ok(true),
        };

        if started.elapsed() > deadline {
            warn!(participant = %short_hex(&participant), phase = ?session.phase, "session still open at deadline");
            return Ok(false);
        }

        if session.phase == SessionPhase::InProgress
            && answered != Some(session.current_question_index)
        {
            if let Some(content_ref) = session.content_ref {
                let index = session.current_question_index;
                let key = LocalComputeOracle::answer_key(&content_ref, index);
                let choice = if rng.gen_bool(accuracy) {
                    key
                } else {
                    (key + rng.gen_range(1..OPTIONS_PER_QUESTION)) % OPTIONS_PER_QUESTION
                };
                engine.submit_answer(participant, AnswerOption::Choice(choice))?;
                answered = Some(index);
            }
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn print_summary(summary: &SimulationSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{:<18} {:>9} {:>10} {:>10}", "participant", "score", "reward", "retained");
    for result in &summary.participants {
        println!(
            "{:<18} {:>6}/{:<2} {:>10} {:>10}",
            result.participant, result.correct, result.total, result.reward, result.retained
        );
    }
    println!();
    println!("vault balance:   {}", summary.vault_balance);
    println!("unfinished:      {}", summary.unfinished);
    println!(
        "relay:           {} delivered, {} redelivered, {} rejected",
        summary.relay.delivered, summary.relay.redelivered, summary.relay.rejected
    );
    info!(
        settled = summary.engine.sessions_settled,
        rewarded = summary.engine.total_rewarded,
        retained = summary.engine.total_retained,
        "simulation finished"
    );
    Ok(())
}
