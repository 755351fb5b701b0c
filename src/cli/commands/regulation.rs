use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("regulation-max-retries")
                .long("regulation-max-retries")
                .help("Failed attempts inside the window before a ban (0 disables)")
                .env("GARDISTO_REGULATION_MAX_RETRIES")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("regulation-find-time-seconds")
                .long("regulation-find-time-seconds")
                .help("Width of the sliding attempt window")
                .env("GARDISTO_REGULATION_FIND_TIME_SECONDS")
                .default_value("120")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("regulation-ban-time-seconds")
                .long("regulation-ban-time-seconds")
                .help("Ban duration once the window fills with failures")
                .env("GARDISTO_REGULATION_BAN_TIME_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
}
