use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::{Proxy, Url};
use std::env;
use std::path::PathBuf;

/// What the interactive loop does with each line of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every turn is sent along with the whole conversation so far.
    ChatWithContext,
    /// Every turn is sent on its own.
    ChatNoContext,
    /// Every turn is used as an image generation prompt.
    Image,
}

impl TryFrom<u8> for Mode {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Mode::ChatWithContext),
            1 => Ok(Mode::ChatNoContext),
            2 => Ok(Mode::Image),
            other => bail!("unknown mode {}", other),
        }
    }
}

#[derive(Debug, Parser)]
#[clap(
    name = "gptty",
    version = "0.1.0",
    about = "Chat with OpenAI models or generate images from the terminal. Type 'exit' to quit."
)]
pub struct Config {
    #[clap(
        long("api"),
        value_name = "URL",
        help = "The API endpoint base URL to use.",
        default_value = "https://api.openai.com"
    )]
    pub api: String,

    #[clap(
        short('k'),
        long("key"),
        value_name = "API_KEY",
        help = "Sets the API key for the remote endpoint; if absent, the envvar 'OPENAI_API_KEY' is checked",
        default_value = ""
    )]
    pub api_key: String,

    #[clap(
        short('o'),
        long("org"),
        value_name = "ORG_ID",
        help = "Your organization id, leave empty if you don't have one",
        default_value = ""
    )]
    pub organization: String,

    #[clap(
        short('p'),
        long,
        value_name = "PORT",
        help = "The port of the local HTTP proxy that requests are routed through",
        default_value_t = 7890
    )]
    pub proxy_port: u16,

    #[clap(
        long,
        help = "Connect to the API directly instead of through the local proxy",
        default_value_t = false
    )]
    pub no_proxy: bool,

    #[clap(
        short('m'),
        long,
        value_name = "MODE",
        help = "Program mode, 0: chat with context; 1: chat without context; 2: image generator",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=2)
    )]
    pub mode: u8,

    #[clap(
        short('d'),
        long("dir"),
        value_name = "DIR",
        help = "The directory generated images are saved into",
        default_value = "./images"
    )]
    pub image_dir: PathBuf,

    #[clap(
        long("model"),
        value_name = "MODEL_ID",
        help = "Sets the model to use for chat completions",
        default_value = "gpt-3.5-turbo"
    )]
    pub model_id: String,

    #[clap(
        long,
        value_name = "MODEL_ID",
        help = "Sets the model to use for image generation; the API default is used if absent"
    )]
    pub image_model: Option<String>,
}

impl Config {
    /// Parses the command line into a `Config`.
    ///
    /// Invalid flags, including a mode outside 0..=2, make clap print the usage and
    /// exit the process. If `--key` is empty, the key is read from the `OPENAI_API_KEY`
    /// environment variable instead.
    ///
    /// # Returns
    /// - `Result<Self>`: the configuration, or an Err if no API key was supplied
    ///   either way.
    pub fn from_cli() -> Result<Self> {
        let mut config = Config::parse();

        // Fallback to environment variable if api_key is not provided
        if config.api_key.is_empty() {
            config.api_key = env::var("OPENAI_API_KEY").context(
                "API key must be provided via --key or OPENAI_API_KEY environment variable",
            )?;
        }

        Ok(config)
    }

    /// The `-m` flag as a `Mode`. Only fails for configs built without clap's range check.
    pub fn mode(&self) -> Result<Mode> {
        Mode::try_from(self.mode)
    }

    /// The proxy all outbound requests go through, or `None` when `--no-proxy` is set.
    pub fn proxy(&self) -> Result<Option<Proxy>> {
        if self.no_proxy {
            return Ok(None);
        }
        let url = Url::parse(&format!("http://localhost:{}", self.proxy_port))
            .context("malformed proxy address")?;
        let proxy = Proxy::all(url).context("invalid proxy")?;
        Ok(Some(proxy))
    }
}
