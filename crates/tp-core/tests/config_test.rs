use tp_core::config::{Config, ProviderKind};
use tp_core::types::ModelTier;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert!(!cfg.general.json_logs);
    assert_eq!(cfg.general.default_provider, "anthropic");
    assert_eq!(cfg.agent_loop.max_steps, 50);
    assert_eq!(cfg.agent_loop.total_timeout_secs, 600);
    assert_eq!(cfg.terminal.kill_grace_ms, 3_000);
    assert!(cfg.presets.is_empty());
    cfg.validate().expect("default config validates");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.agent_loop.max_steps, cfg.agent_loop.max_steps);
    assert_eq!(parsed.terminal.kill_grace_ms, cfg.terminal.kill_grace_ms);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[agent_loop]
max_steps = 7

[[presets]]
id = "local-agent"
kind = "acp"
command = "my-agent"
args = ["--stdio"]

[[presets]]
id = "remote"
kind = "tcp"
address = "127.0.0.1:7777"

[[specialists]]
id = "reviewer"
name = "Reviewer"
model = "claude-opus-4-20250514"

[model_tiers.anthropic]
fast = "claude-haiku-custom"
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    cfg.validate().expect("config validates");
    assert_eq!(cfg.agent_loop.max_steps, 7);
    // defaults fill in the rest
    assert_eq!(cfg.agent_loop.total_timeout_secs, 600);

    let preset = cfg.preset("local-agent").expect("user preset");
    match preset.provider {
        ProviderKind::Acp { command, args, .. } => {
            assert_eq!(command, "my-agent");
            assert_eq!(args, vec!["--stdio".to_string()]);
        }
        other => panic!("expected acp preset, got {:?}", other),
    }
    assert!(matches!(
        cfg.preset("remote").unwrap().provider,
        ProviderKind::Tcp { .. }
    ));

    let tiers = cfg.tier_table();
    assert_eq!(tiers["anthropic"][&ModelTier::Fast], "claude-haiku-custom");
    // untouched tiers keep their defaults
    assert_eq!(
        tiers["anthropic"][&ModelTier::Balanced],
        "claude-sonnet-4-20250514"
    );
}

#[test]
fn builtin_presets_are_available_without_config() {
    let cfg = Config::default();
    assert!(cfg.preset("opencode").is_some());
    assert!(matches!(
        cfg.preset("claude-code").unwrap().provider,
        ProviderKind::ClaudeCode { .. }
    ));
    assert!(cfg.preset("no-such-preset").is_none());
}

#[test]
fn user_specialist_shadows_builtin() {
    let cfg: Config = toml::from_str(
        r#"
[[specialists]]
id = "verifier"
model = "pinned-model"
"#,
    )
    .unwrap();
    let all = cfg.all_specialists();
    let verifiers: Vec<_> = all.iter().filter(|s| s.id == "verifier").collect();
    assert_eq!(verifiers.len(), 1);
    assert_eq!(verifiers[0].model.as_deref(), Some("pinned-model"));
    assert!(all.iter().any(|s| s.id == "coordinator"));
}

#[test]
fn zero_max_steps_fails_validation() {
    let mut cfg = Config::default();
    cfg.agent_loop.max_steps = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_steps"));
}

#[test]
fn duplicate_preset_ids_fail_validation() {
    let cfg: Config = toml::from_str(
        r#"
[[presets]]
id = "a"
kind = "tcp"
address = "127.0.0.1:1"

[[presets]]
id = "a"
kind = "tcp"
address = "127.0.0.1:2"
"#,
    )
    .unwrap();
    let err = cfg.validate().expect_err("duplicate ids");
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[general]\nlog_level = \"debug\"\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.general.log_level, "debug");

    let missing = Config::load_from(dir.path().join("missing.toml"));
    assert!(missing.is_err());
}
