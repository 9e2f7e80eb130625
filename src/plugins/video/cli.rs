use crate::core::model::{CookieSource, Quality};
use crate::plugins::registry::{CliPlugin, DownloadCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

pub struct VideoCliPlugin;

impl VideoCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for VideoCliPlugin {
    fn name(&self) -> &'static str {
        "video"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("video_quality")
                .long("quality")
                .help_heading("Video")
                .help("Height ceiling such as 720p or 1080p, or highest / lowest")
                .default_value("720p")
                .num_args(1),
        )
        .arg(
            Arg::new("video_audio_only")
                .long("audio-only")
                .help_heading("Video")
                .help("Download the audio track only (mp3)")
                .action(ArgAction::SetTrue)
                .conflicts_with("video_video_only"),
        )
        .arg(
            Arg::new("video_video_only")
                .long("video-only")
                .help_heading("Video")
                .help("Download the video stream without audio")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video_playlist")
                .long("playlist")
                .help_heading("Video")
                .help("Download the whole playlist instead of the single entry")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video_extract_audio")
                .long("extract-audio")
                .help_heading("Video")
                .help("Also write an mp3 next to the downloaded video")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video_subs")
                .long("subs")
                .help_heading("Video")
                .help("Subtitle languages, comma separated, e.g. en,de")
                .value_delimiter(',')
                .num_args(1),
        )
        .arg(
            Arg::new("video_cookies")
                .long("cookies")
                .help_heading("Video")
                .help("Netscape cookie file for signed-in downloads")
                .conflicts_with("video_cookies_browser")
                .num_args(1),
        )
        .arg(
            Arg::new("video_cookies_browser")
                .long("cookies-from-browser")
                .help_heading("Video")
                .help("Read cookies from a local browser profile, e.g. firefox or chrome")
                .num_args(1),
        )
        .arg(
            Arg::new("video_rate_limit")
                .long("rate-limit")
                .help_heading("Video")
                .help("Maximum download rate in bytes per second")
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        let o = &mut cfg.options;
        if let Some(q) = matches.get_one::<String>("video_quality") {
            o.quality = q.parse::<Quality>()?;
        }
        o.audio_only = matches.get_flag("video_audio_only");
        o.video_only = matches.get_flag("video_video_only");
        o.playlist = matches.get_flag("video_playlist");
        o.extract_audio = matches.get_flag("video_extract_audio");

        if let Some(langs) = matches.get_many::<String>("video_subs") {
            o.subtitles = langs.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(path) = matches.get_one::<String>("video_cookies") {
            o.cookies = Some(CookieSource::File(PathBuf::from(path)));
        } else if let Some(browser) = matches.get_one::<String>("video_cookies_browser") {
            o.cookies = Some(CookieSource::Browser(browser.clone()));
        }
        if let Some(s) = matches.get_one::<String>("video_rate_limit") {
            o.rate_limit = Some(s.parse()?);
        }
        Ok(())
    }
}
