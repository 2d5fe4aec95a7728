//! Integration tests for Sampler.

mod common;

use std::collections::HashSet;

use common::{ScriptedRuntime, EOS, VOCAB_SIZE};
use lm_session::config::SamplingConfig;
use lm_session::{Error, GrammarConstraint, Sampler, Token};

fn vocab() -> ScriptedRuntime {
    ScriptedRuntime::new(64)
}

fn peaked(id: u8) -> Vec<f32> {
    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[id as usize] = 10.0;
    logits
}

fn spread() -> Vec<f32> {
    (0..VOCAB_SIZE)
        .map(|i| ((i * 37) % 11) as f32 * 0.3)
        .collect()
}

fn sample_n(sampler: &mut Sampler, logits: &[f32], n: usize) -> Vec<Token> {
    let vocab = vocab();
    (0..n)
        .map(|_| sampler.sample(logits, &[], None, &vocab).unwrap())
        .collect()
}

#[test]
fn test_greedy_sampling() {
    let mut sampler = Sampler::with_seed(SamplingConfig::greedy(), 42);
    let token = sampler.sample(&peaked(b'k'), &[], None, &vocab()).unwrap();
    assert_eq!(token, Token::from(b'k'));
}

#[test]
fn test_greedy_ignores_sampling_mode() {
    for mode in [0u8, 1, 2, 7] {
        let config = SamplingConfig::greedy().mirostat(mode);
        let mut sampler = Sampler::with_seed(config, 1);
        let token = sampler.sample(&spread(), &[], None, &vocab()).unwrap();
        // Highest score is 3.0 and id 8 is the first to reach it.
        assert_eq!(token, 8, "mode {mode}");
    }
}

#[test]
fn test_deterministic_with_seed() {
    for mode in [0u8, 1, 2] {
        let config = SamplingConfig::default().temperature(1.0).mirostat(mode);
        let mut a = Sampler::with_seed(config.clone(), 1234);
        let mut b = Sampler::with_seed(config, 1234);

        let logits = spread();
        assert_eq!(sample_n(&mut a, &logits, 32), sample_n(&mut b, &logits, 32));
    }
}

#[test]
fn test_temperature_sampling_varies() {
    let config = SamplingConfig::default().temperature(1.0).top_k(0).top_p(1.0);
    let mut sampler = Sampler::with_seed(config, 42);

    let seen: HashSet<Token> = sample_n(&mut sampler, &vec![1.0; VOCAB_SIZE], 100)
        .into_iter()
        .collect();
    assert!(seen.len() > 1, "Should sample different tokens");
}

#[test]
fn test_top_k_limits_choices() {
    let config = SamplingConfig::default().temperature(1.0).top_k(2).top_p(1.0);
    let mut sampler = Sampler::with_seed(config, 7);

    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[10] = 5.0;
    logits[20] = 5.0;
    logits[30] = 4.9;

    for token in sample_n(&mut sampler, &logits, 50) {
        assert!(token == 10 || token == 20, "unexpected token {token}");
    }
}

#[test]
fn test_repetition_penalty_changes_greedy_choice() {
    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[b'a' as usize] = 5.0;
    logits[b'b' as usize] = 4.0;

    let config = SamplingConfig::greedy().repeat_penalty(2.0);
    let mut sampler = Sampler::with_seed(config, 1);
    let recent = [Token::from(b'a')];
    let token = sampler.sample(&logits, &recent, None, &vocab()).unwrap();
    assert_eq!(token, Token::from(b'b'));
}

#[test]
fn test_invalid_mode_is_sampling_error() {
    let config = SamplingConfig::default().temperature(0.8).mirostat(3);
    let mut sampler = Sampler::with_seed(config, 1);
    let err = sampler.sample(&spread(), &[], None, &vocab()).unwrap_err();
    assert!(matches!(err, Error::Sampling(_)));
}

#[test]
fn test_mirostat_unavailable() {
    let config = SamplingConfig::default().temperature(0.8).mirostat(2);
    let mut sampler = Sampler::with_seed(config, 1).with_mirostat_available(false);
    let err = sampler.sample(&spread(), &[], None, &vocab()).unwrap_err();
    assert!(matches!(err, Error::FeatureUnavailable("mirostat")));
}

/// One token far ahead of the rest, so its probability rounds to 1.
fn dominant(id: u8) -> Vec<f32> {
    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[id as usize] = 50.0;
    logits
}

fn mirostat_sampler(mode: u8) -> Sampler {
    let config = SamplingConfig::default().temperature(1.0).mirostat(mode);
    Sampler::with_seed(config, 5)
}

#[test]
fn test_mirostat_mu_follows_surprise() {
    for mode in [1u8, 2] {
        let mut sampler = mirostat_sampler(mode);
        let tau = sampler.config().mirostat_target_entropy;
        let eta = sampler.config().mirostat_learning_rate;
        assert_eq!(sampler.mirostat_mu(), None);

        // Surprise of a certain token is 0, so mu grows by eta * tau per draw.
        let tokens = sample_n(&mut sampler, &dominant(b'q'), 2);
        assert_eq!(tokens, vec![Token::from(b'q'); 2], "mode {mode}");

        let expected = 2.0 * tau + 2.0 * eta * tau;
        let mu = sampler.mirostat_mu().unwrap();
        assert!((mu - expected).abs() < 1e-4, "mode {mode}: mu {mu}, expected {expected}");
    }
}

#[test]
fn test_mirostat_mu_tracks_drawn_probability() {
    let mut sampler = mirostat_sampler(2);
    let tau = sampler.config().mirostat_target_entropy;
    let eta = sampler.config().mirostat_learning_rate;

    // Two equally likely tokens: one bit of surprise whichever is drawn.
    let mut logits = vec![-100.0; VOCAB_SIZE];
    logits[3] = 1.0;
    logits[4] = 1.0;
    let token = sample_n(&mut sampler, &logits, 1)[0];
    assert!(token == 3 || token == 4);

    let expected = 2.0 * tau - eta * (1.0 - tau);
    assert!((sampler.mirostat_mu().unwrap() - expected).abs() < 1e-4);
}

#[test]
fn test_mirostat_v1_single_candidate() {
    let mut sampler = mirostat_sampler(1);
    let tau = sampler.config().mirostat_target_entropy;
    let eta = sampler.config().mirostat_learning_rate;

    // Too few candidates to estimate the distribution's shape.
    let token = sampler.sample(&[0.5], &[], None, &vocab()).unwrap();
    assert_eq!(token, 0);
    let mu = sampler.mirostat_mu().unwrap();
    assert!((mu - (2.0 * tau + eta * tau)).abs() < 1e-4);
}

#[test]
fn test_mirostat_reset() {
    let mut sampler = mirostat_sampler(2);
    sample_n(&mut sampler, &spread(), 3);
    assert!(sampler.mirostat_mu().is_some_and(f32::is_finite));

    sampler.reset_mirostat();
    assert_eq!(sampler.mirostat_mu(), None);
}

#[test]
fn test_negative_temperature_samples() {
    let config = SamplingConfig::default().temperature(-1.0).top_k(0).top_p(1.0);
    let mut sampler = Sampler::with_seed(config, 3);

    // Negation flips the order; the former favourite becomes the least likely.
    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[b'k' as usize] = 100.0;
    for token in sample_n(&mut sampler, &logits, 20) {
        assert_ne!(token, Token::from(b'k'));
    }
}

#[test]
fn test_grammar_filters_and_advances() {
    let mut grammar = GrammarConstraint::parse(r#"root ::= "yes" | "no""#, false).unwrap();
    let mut sampler = Sampler::with_seed(SamplingConfig::greedy(), 1);
    let vocab = vocab();

    // 'x' has the best score but the grammar only allows 'y' or 'n'.
    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[b'x' as usize] = 9.0;
    logits[b'y' as usize] = 2.0;
    let first = sampler
        .sample(&logits, &[], Some(&mut grammar), &vocab)
        .unwrap();
    assert_eq!(first, Token::from(b'y'));

    let mut picked = vec![first];
    for _ in 0..2 {
        let token = sampler
            .sample(&peaked(b'x'), &[], Some(&mut grammar), &vocab)
            .unwrap();
        picked.push(token);
    }
    assert_eq!(picked, vec![Token::from(b'y'), Token::from(b'e'), Token::from(b's')]);
    assert!(grammar.is_complete());

    // Only end-of-sequence is left.
    let last = sampler
        .sample(&peaked(b'x'), &[], Some(&mut grammar), &vocab)
        .unwrap();
    assert_eq!(last, EOS);
}

#[test]
fn test_grammar_override_forces_greedy() {
    let grammar = GrammarConstraint::parse("root ::= [a-c]", true).unwrap();
    let config = SamplingConfig::default().temperature(1.5);
    let vocab = vocab();

    let mut logits = vec![0.0; VOCAB_SIZE];
    logits[b'a' as usize] = 1.0;
    logits[b'b' as usize] = 1.2;
    logits[b'c' as usize] = 1.1;

    for seed in 0..10 {
        let mut sampler = Sampler::with_seed(config.clone(), seed);
        let mut g = grammar.clone();
        assert_eq!(
            sampler.sample(&logits, &[], Some(&mut g), &vocab).unwrap(),
            Token::from(b'b')
        );
    }
}

#[test]
fn test_empty_logits() {
    let mut sampler = Sampler::with_seed(SamplingConfig::greedy(), 1);
    assert!(matches!(
        sampler.sample(&[], &[], None, &vocab()),
        Err(Error::Sampling(_))
    ));
}
