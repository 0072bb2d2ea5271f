const RESET: &str = "\x1b[0m";
const ACCENT: &str = "\x1b[38;5;179m";
const DIM_GRAY: &str = "\x1b[2;90m";

const BANNER: &str = r#"
 __      __      _  __                   ___
 \ \    / /_  _ | |/ /___  _ _   __ _   / _ \ _  _  ___  _  _  ___
  \ \/\/ /| || || ' </ _ \| ' \ / _` | | (_) | || |/ -_)| || |/ -_)
   \_/\_/  \_,_||_|\_\___/|_||_|\__, |  \__\_\\_,_|\___| \_,_|\___|
                                |___/"#;
const TAGLINE: &str = "Bounded blocking FIFO queue served over TCP.";

/// Lines printed before the logger takes over. Colours only when asked for.
pub fn banner_lines(colored: bool) -> Vec<String> {
    let (accent, dim, reset) = if colored {
        (ACCENT, DIM_GRAY, RESET)
    } else {
        ("", "", "")
    };

    vec![
        format!("{accent}{BANNER}{reset}"),
        format!(
            "{} v{} | build {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("WUKONGQUEUE_BUILD_DATE_UTC")
        ),
        format!("{dim}{TAGLINE}{reset}"),
        String::new(),
    ]
}

pub fn print_startup_banner(colored: bool) {
    for line in banner_lines(colored) {
        println!("{line}");
    }
}
