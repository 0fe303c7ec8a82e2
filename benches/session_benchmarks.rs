//! Session engine benchmarks
//!
//! Measures the hot paths of a session: topic selection, reward math and a
//! full start-to-settlement round trip with in-process oracles.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use stakequiz::session::compute_reward;
use stakequiz::session::state::{derive_content_seed, select_topics};
use stakequiz::{
    AnswerOption, LocalComputeOracle, LocalRandomnessOracle, ManualClock, QuizConfig, QuizEngine,
    QuizTokens, Topic, TokenLedger, VAULT_ADDRESS,
};

fn benchmark_pure_helpers(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_helpers");

    group.bench_function("select_three_of_twelve", |b| {
        let seed = derive_content_seed(&[42u8; 32]);
        b.iter(|| select_topics(black_box(&Topic::ALL), black_box(&seed), 3))
    });

    group.bench_function("compute_reward", |b| {
        b.iter(|| compute_reward(black_box(QuizTokens::new(987_654)), black_box(7), black_box(10)))
    });

    group.finish();
}

fn benchmark_full_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_round_trip");
    group.sample_size(50);

    group.bench_function("start_to_settlement_10_questions", |b| {
        let ledger = Arc::new(TokenLedger::new());
        let randomness = Arc::new(LocalRandomnessOracle::from_seed(1, 1));
        let compute = Arc::new(LocalComputeOracle::new(1));
        let engine = QuizEngine::new(
            QuizConfig::default(),
            randomness.clone(),
            compute.clone(),
            ledger.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let player = [7u8; 32];
        let preferences = &Topic::ALL[..5];

        b.iter(|| {
            ledger.mint(player, QuizTokens::new(100)).unwrap();
            ledger.approve(player, VAULT_ADDRESS, QuizTokens::new(100));
            engine.start(player, preferences, QuizTokens::new(100)).unwrap();

            for (id, word) in randomness.drain_ready() {
                engine.on_randomness_fulfilled(id, word).unwrap();
            }
            for (id, bytes) in compute.drain_ready() {
                engine.on_compute_fulfilled(id, &bytes).unwrap();
            }
            while engine.session(&player).is_some() {
                engine
                    .submit_answer(player, AnswerOption::Choice(0))
                    .unwrap();
                for (id, bytes) in compute.drain_ready() {
                    engine.on_compute_fulfilled(id, &bytes).unwrap();
                }
            }
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_pure_helpers, benchmark_full_session);
criterion_main!(benches);
