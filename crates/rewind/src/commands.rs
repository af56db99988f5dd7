use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use rewind_daemon::Viewport;

const LONG_ABOUT: &str = r##"rewind records a browser session and lets you travel back to any moment of it.

WORKFLOW:
    1. Start a recorder with a browser driver (REWIND_BROWSER_CMD)
    2. Drive the page with 'rewind action <tool> [args]'
    3. Resolve a moment with 'rewind resolve <locator>'
    4. Render it with 'rewind replay <locator>'
    5. Stop the recorder when done

LOCATORS:
    42                  Absolute frame index
    #42                 Absolute frame index (explicit)
    1718000000123#1     Timestamp plus ordinal among frames sharing it
    @1718000000123      Epoch milliseconds, rounded down to the nearest frame
    1718000000123       Same (values of 10^11 and above are timestamps)
    +1500 / +2s         Offset from the first frame
    2024-06-10T06:13:20Z
                        Wall-clock time, rounded down

EXAMPLES:
    REWIND_BROWSER_CMD="node driver.js" rewind daemon --url https://example.com &
    rewind action click '{"selector":"#login"}'
    rewind resolve +2s
    rewind replay +2s --output image --path moment.png
    rewind stop"##;

#[derive(Parser)]
#[command(name = "rewind")]
#[command(author, version)]
#[command(about = "Browser session recorder with time travel")]
#[command(long_about = LONG_ABOUT)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Output as JSON (shorthand for --format json)
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable colored output (also respects NO_COLOR env var)
    #[arg(long, global = true, env = "NO_COLOR", value_parser = clap::builder::FalseyValueParser::new())]
    pub no_color: bool,

    /// Control socket of the recorder
    #[arg(long, global = true, env = "REWIND_SOCKET")]
    pub socket: Option<PathBuf>,
}

impl Cli {
    /// Returns the effective output format, considering --json shorthand.
    pub fn effective_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            self.format
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the recorder in the foreground
    #[command(long_about = r#"Run the recorder in the foreground.

Takes the singleton lock, opens the control socket, launches the browser
driver named by REWIND_BROWSER_CMD and records every event it reports
until SIGINT or SIGTERM.

EXAMPLES:
    rewind daemon --url https://example.com
    rewind daemon --url https://example.com --viewport 1920x1080"#)]
    Daemon {
        #[command(flatten)]
        start: StartArgs,
    },

    /// Check that a recorder answers
    Ping,

    /// Show the recorder's lifecycle state and current run
    Status,

    /// List the tabs seen in the current run
    Tabs,

    /// Send a browser action to the recorder
    #[command(long_about = r#"Send a browser action to the recorder.

TOOLS:
    navigate       {"url": "...", "wait": "load|dom_content_loaded|network_idle"}
    click, hover   {"selector": "..."}
    type           {"selector": "...", "text": "..."}
    select         {"selector": "...", "values": ["..."]}
    upload         {"selector": "...", "files": ["..."]}
    evaluate       {"expression": "...", "args": [...]}
    wait_for       {"selector": "...", "state": "visible", "timeoutMs": 5000}
    resize         {"width": 1280, "height": 720}
    screenshot     {"path": "...", "fullPage": false}
    snapshot_html, close

EXAMPLES:
    rewind action navigate '{"url":"https://example.com"}'
    rewind action click '{"selector":"button.submit"}'
    rewind action snapshot_html"#)]
    Action {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        args: Option<String>,
    },

    /// Resolve a locator to a recorded frame
    Resolve {
        /// Frame locator (index, ts#k, @ts, +offset or ISO time)
        locator: String,

        /// Restrict resolution to one tab
        #[arg(long)]
        tab: Option<u32>,

        /// Resolve against a run directory on disk instead of the recorder
        #[arg(long, value_name = "DIR")]
        run: Option<PathBuf>,
    },

    /// Render the page as it was at a locator
    Replay {
        /// Frame locator (index, ts#k, @ts, +offset or ISO time)
        locator: String,

        /// Restrict resolution to one tab
        #[arg(long)]
        tab: Option<u32>,

        /// Artifact type
        #[arg(short, long, value_enum, default_value = "html")]
        output: ReplayFormat,

        /// Where an image artifact is written
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Stop the running recorder
    Stop {
        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,
    },

    /// Stop the running recorder, then start a new one in the background
    Restart {
        #[command(flatten)]
        start: StartArgs,
    },

    /// Rebuild a run's frame index from its event log
    #[command(long_about = r#"Rebuild a run's frame index from its event log.

The event log is the source of truth. Without --verify, frame files that
differ from a fresh derivation are rewritten. With --verify nothing is
written and a mismatch exits non-zero.

EXAMPLES:
    rewind reindex ~/.rewind/runs/20240610-061320-1a2b3c4d
    rewind reindex ~/.rewind/runs/20240610-061320-1a2b3c4d --verify"#)]
    Reindex {
        /// Run directory
        dir: PathBuf,

        /// Compare only, do not rewrite
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct StartArgs {
    /// Page to open once the browser is up
    #[arg(long, env = "REWIND_URL")]
    pub url: Option<String>,

    /// Initial viewport as WIDTHxHEIGHT
    #[arg(long, default_value = "1280x720", value_parser = parse_viewport)]
    pub viewport: Viewport,
}

fn parse_viewport(s: &str) -> Result<Viewport, String> {
    s.parse()
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum ReplayFormat {
    #[default]
    Html,
    Image,
}
