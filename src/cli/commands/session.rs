use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("session-domain")
                .long("session-domain")
                .help("Protected cookie domain as DOMAIN=PORTAL_URL[|DEFAULT_REDIRECTION_URL]; repeatable")
                .env("GARDISTO_SESSION_DOMAIN")
                .action(clap::ArgAction::Append)
                .required(true),
        )
        .arg(
            Arg::new("session-backend")
                .long("session-backend")
                .help("Session backend: memory or postgres")
                .env("GARDISTO_SESSION_BACKEND")
                .default_value("memory"),
        )
        .arg(
            Arg::new("session-inactivity-seconds")
                .long("session-inactivity-seconds")
                .help("Sliding inactivity timeout for sessions")
                .env("GARDISTO_SESSION_INACTIVITY_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-expiration-seconds")
                .long("session-expiration-seconds")
                .help("Absolute session lifetime")
                .env("GARDISTO_SESSION_EXPIRATION_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-remember-me-seconds")
                .long("session-remember-me-seconds")
                .help("Absolute lifetime for remember-me sessions")
                .env("GARDISTO_SESSION_REMEMBER_ME_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-same-site")
                .long("session-same-site")
                .help("SameSite attribute for the session cookie")
                .env("GARDISTO_SESSION_SAME_SITE")
                .default_value("Lax"),
        )
        .arg(
            Arg::new("elevation-window-seconds")
                .long("elevation-window-seconds")
                .help("How recent a second factor must be for credential changes")
                .env("GARDISTO_ELEVATION_WINDOW_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
}
