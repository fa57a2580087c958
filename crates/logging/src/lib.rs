//! Logger setup shared by everything embedding the socket engine.
//!
//! The engine itself only talks to the `log` facade.  Binaries and tests call one of these once at startup.

/// Log to stderr, filtered by `RUST_LOG` and falling back to `default_filter` when it is unset.
///
/// If called multiple times in the same process, only the first call applies.
pub fn log_to_stderr_with_default(default_filter: &str) {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(default_filter);
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                use std::io::Write;

                let now = time::OffsetDateTime::now_utc();

                writeln!(
                    buf,
                    "{} {} time={} target={}",
                    record.level(),
                    record.args(),
                    now,
                    record.target()
                )
            })
            .is_test(cfg!(test))
            .try_init();
    });
}

/// Log to stderr at `debug` unless `RUST_LOG` says otherwise.
pub fn log_to_stderr() {
    log_to_stderr_with_default("debug");
}
