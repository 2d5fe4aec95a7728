//! Integration tests for session configuration.

use std::io::Write;

use lm_session::config::{SamplingConfig, SessionParams, DEFAULT_CONTEXT_SIZE};
use lm_session::Error;
use tempfile::NamedTempFile;

#[test]
fn test_defaults() {
    let params = SessionParams::default();
    assert_eq!(params.n_ctx, DEFAULT_CONTEXT_SIZE);
    assert_eq!(params.n_ctx_window_top_bar, 0);
    assert_eq!(params.n_batch, 8);
    assert_eq!(params.n_gpu_layers, 38);
    assert!(params.use_mlock);

    let sampling = &params.sampling;
    assert_eq!(sampling.top_k, 40);
    assert_eq!(sampling.top_p, 0.9);
    assert_eq!(sampling.temp, 0.72);
    assert_eq!(sampling.tfs_z, 1.0);
    assert_eq!(sampling.typical_p, 1.0);
    assert_eq!(sampling.repeat_penalty, 1.0);
    assert_eq!(sampling.mirostat_learning_rate, 0.1);
    assert_eq!(sampling.mirostat_target_entropy, 5.0);
    assert_eq!(sampling.prefer_mirostat, 0);
}

#[test]
fn test_builders() {
    let params = SessionParams::default()
        .seed(9)
        .context_size(512)
        .top_bar(32)
        .scroll_keep(0.4)
        .batch_size(16)
        .eos_ignores(2)
        .repeat_last(64)
        .sampling(SamplingConfig::greedy().top_k(10).mirostat(2));

    assert!(params.validate().is_ok());
    assert_eq!(params.n_ctx, 512);
    assert_eq!(params.n_ctx_window_top_bar, 32);
    assert_eq!(params.n_eos_ignores, 2);
    assert_eq!(params.sampling.temp, 0.0);
    assert_eq!(params.sampling.top_k, 10);
    assert_eq!(params.sampling.prefer_mirostat, 2);
}

#[test]
fn test_validation_errors() {
    let bad = [
        SessionParams::default().context_size(0),
        SessionParams::default().batch_size(0),
        SessionParams::default().context_size(64).top_bar(64),
        SessionParams::default().scroll_keep(-0.1),
        SessionParams::default().sampling(SamplingConfig::default().repeat_penalty(0.0)),
        SessionParams::default().sampling(SamplingConfig::default().temperature(f32::INFINITY)),
    ];
    for params in bad {
        assert!(
            matches!(params.validate(), Err(Error::Config(_))),
            "{params:?} should be rejected"
        );
    }
}

#[test]
fn test_from_json_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"seed": 3, "n_ctx": 256, "n_eos_ignores": 1, "sampling": {{"prefer_mirostat": 1}}}}"#
    )
    .unwrap();

    let params = SessionParams::from_json_file(file.path()).unwrap();
    assert_eq!(params.seed, 3);
    assert_eq!(params.n_ctx, 256);
    assert_eq!(params.n_eos_ignores, 1);
    assert_eq!(params.sampling.prefer_mirostat, 1);
    assert_eq!(params.sampling.top_k, 40);
}

#[test]
fn test_json_round_trip() {
    let params = SessionParams::default().seed(11).context_size(300);
    let json = serde_json::to_string(&params).unwrap();
    assert_eq!(SessionParams::from_json_str(&json).unwrap(), params);
}

#[test]
fn test_invalid_json() {
    assert!(matches!(
        SessionParams::from_json_str("{ not json"),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        SessionParams::from_json_file("/nonexistent/params.json"),
        Err(Error::Io(_))
    ));
}
