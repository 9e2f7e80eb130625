use crate::plugins::registry::{CliPlugin, DownloadCliConfig};
use clap::{Arg, ArgMatches, Command};

pub struct PhotoCliPlugin;

impl PhotoCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for PhotoCliPlugin {
    fn name(&self) -> &'static str {
        "photo"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("photo_username")
                .long("photo-username")
                .help_heading("Photo network")
                .help("Account used to sign in before photo network downloads")
                .env("MG_PHOTO_USERNAME")
                .num_args(1),
        )
        .arg(
            Arg::new("photo_password")
                .long("photo-password")
                .help_heading("Photo network")
                .help("Password for --photo-username")
                .env("MG_PHOTO_PASSWORD")
                .hide_env_values(true)
                .requires("photo_username")
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        cfg.photo_username = matches.get_one::<String>("photo_username").cloned();
        cfg.photo_password = matches.get_one::<String>("photo_password").cloned();
        if cfg.photo_username.is_some() && cfg.photo_password.is_none() {
            anyhow::bail!("--photo-username needs a password (--photo-password or MG_PHOTO_PASSWORD)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<DownloadCliConfig> {
        let plugin = PhotoCliPlugin::new();
        let m = plugin
            .augment_download_command(Command::new("download"))
            .try_get_matches_from(std::iter::once("download").chain(args.iter().copied()))?;
        let mut cfg = DownloadCliConfig::default();
        plugin.apply_download_matches(&m, &mut cfg)?;
        Ok(cfg)
    }

    #[test]
    fn credentials_come_in_pairs() {
        let cfg = parse(&["--photo-username", "alice", "--photo-password", "pw"]).unwrap();
        assert_eq!(cfg.photo_username.as_deref(), Some("alice"));
        assert_eq!(cfg.photo_password.as_deref(), Some("pw"));

        assert!(parse(&["--photo-password", "pw"]).is_err());
    }
}
