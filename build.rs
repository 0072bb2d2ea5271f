use chrono::{DateTime, SecondsFormat, Utc};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Reproducible builds pin the stamp through SOURCE_DATE_EPOCH.
    let stamp = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now);

    println!(
        "cargo:rustc-env=WUKONGQUEUE_BUILD_DATE_UTC={}",
        stamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}
