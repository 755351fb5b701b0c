use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_totp_args(command);
    let command = with_webauthn_args(command);
    with_duo_args(command)
}

fn with_totp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("totp-issuer")
                .long("totp-issuer")
                .help("Issuer shown by authenticator apps; enables TOTP")
                .env("GARDISTO_TOTP_ISSUER"),
        )
        .arg(
            Arg::new("secrets-key")
                .long("secrets-key")
                .help("Base64 32-byte key sealing TOTP secrets at rest")
                .env("GARDISTO_SECRETS_KEY")
                .hide_env_values(true),
        )
}

fn with_webauthn_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("webauthn-rp-id")
                .long("webauthn-rp-id")
                .help("WebAuthn relying party id (the portal's registered domain); enables WebAuthn")
                .env("GARDISTO_WEBAUTHN_RP_ID"),
        )
        .arg(
            Arg::new("webauthn-rp-origin")
                .long("webauthn-rp-origin")
                .help("WebAuthn relying party origin (the portal URL)")
                .env("GARDISTO_WEBAUTHN_RP_ORIGIN"),
        )
}

fn with_duo_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("duo-hostname")
                .long("duo-hostname")
                .help("Duo API hostname; enables Duo push")
                .env("GARDISTO_DUO_HOSTNAME"),
        )
        .arg(
            Arg::new("duo-integration-key")
                .long("duo-integration-key")
                .help("Duo integration key")
                .env("GARDISTO_DUO_INTEGRATION_KEY"),
        )
        .arg(
            Arg::new("duo-secret-key")
                .long("duo-secret-key")
                .help("Duo secret key")
                .env("GARDISTO_DUO_SECRET_KEY")
                .hide_env_values(true),
        )
}
