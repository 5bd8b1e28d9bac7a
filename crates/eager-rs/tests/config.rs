use eager_rs::config::{
    ENV_ASYNC_BUILD, ENV_CACHE_CAPACITY, ENV_EVICT_DYNAMIC, ENV_READY_SPIN, ENV_RELEASE_FORWARD,
};
use eager_rs::RuntimeConfig;

#[test]
fn defaults_round_trip_through_json() -> anyhow::Result<()> {
    let config = RuntimeConfig::default();
    assert!(config.async_kernel_build);
    assert_eq!(config.cache_capacity, None);
    assert!(!config.evict_dynamic_units);

    let parsed = RuntimeConfig::from_json(&config.to_json()?)?;
    assert_eq!(parsed, config);

    let partial = RuntimeConfig::from_json(r#"{ "cache_capacity": 64, "ready_spin_limit": 0 }"#)?;
    assert_eq!(partial.cache_capacity, Some(64));
    assert_eq!(partial.ready_spin_limit, 0);
    assert!(partial.release_forward_outputs);
    Ok(())
}

// The only test in this binary that touches the process environment.
#[test]
fn environment_overrides_defaults() {
    std::env::set_var(ENV_ASYNC_BUILD, "off");
    std::env::set_var(ENV_CACHE_CAPACITY, "128");
    std::env::set_var(ENV_READY_SPIN, "not-a-number");
    std::env::set_var(ENV_RELEASE_FORWARD, "0");
    std::env::set_var(ENV_EVICT_DYNAMIC, "yes");

    let config = RuntimeConfig::from_env();
    assert!(!config.async_kernel_build);
    assert_eq!(config.cache_capacity, Some(128));
    assert_eq!(config.ready_spin_limit, RuntimeConfig::default().ready_spin_limit);
    assert!(!config.release_forward_outputs);
    assert!(config.evict_dynamic_units);

    std::env::set_var(ENV_CACHE_CAPACITY, "0");
    let config = RuntimeConfig::default()
        .with_cache_capacity(Some(8))
        .with_env_overrides();
    assert_eq!(config.cache_capacity, None);

    for name in [
        ENV_ASYNC_BUILD,
        ENV_CACHE_CAPACITY,
        ENV_READY_SPIN,
        ENV_RELEASE_FORWARD,
        ENV_EVICT_DYNAMIC,
    ] {
        std::env::remove_var(name);
    }
    assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
}
