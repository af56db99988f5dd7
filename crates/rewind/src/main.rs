use clap::Parser;

use rewind::color;
use rewind::color::Colors;
use rewind::commands::Cli;
use rewind::commands::Commands;
use rewind::error::CliError;
use rewind::handlers;
use rewind::handlers::HandlerContext;
use rewind::telemetry::init_tracing;
use rewind_ipc::socket_path;

fn main() {
    let cli = Cli::parse();
    color::init(cli.no_color);

    let default_level = match cli.command {
        Commands::Daemon { .. } => "info",
        _ => "warn",
    };
    let _telemetry = init_tracing(default_level);

    if let Err(e) = run(cli) {
        eprintln!("{} {}", Colors::error("Error:"), e);
        eprintln!("{} {}", Colors::dim("Suggestion:"), e.suggestion());
        if e.is_retryable() {
            eprintln!(
                "{}",
                Colors::dim("(This error may be transient - retry may succeed)")
            );
        }
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let format = cli.effective_format();
    let socket = cli.socket.unwrap_or_else(socket_path);
    let ctx = HandlerContext::new(format, socket);

    match cli.command {
        Commands::Daemon { start } => handlers::handle_daemon(&ctx, start),
        Commands::Stop { force } => handlers::handle_stop(&ctx, force),
        Commands::Restart { start } => handlers::handle_restart(&ctx, start),
        Commands::Reindex { dir, verify } => handlers::handle_reindex(&ctx, &dir, verify),
        Commands::Resolve {
            locator,
            tab,
            run: Some(dir),
        } => handlers::handle_resolve_offline(&ctx, &dir, locator, tab),
        command => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(CliError::Runtime)?;
            runtime.block_on(async {
                match command {
                    Commands::Ping => handlers::handle_ping(&ctx).await,
                    Commands::Status => handlers::handle_status(&ctx).await,
                    Commands::Tabs => handlers::handle_tabs(&ctx).await,
                    Commands::Action { tool, args } => {
                        handlers::handle_action(&ctx, tool, args).await
                    }
                    Commands::Resolve { locator, tab, .. } => {
                        handlers::handle_resolve(&ctx, locator, tab).await
                    }
                    Commands::Replay {
                        locator,
                        tab,
                        output,
                        path,
                    } => handlers::handle_replay(&ctx, locator, tab, output, path).await,
                    Commands::Daemon { .. }
                    | Commands::Stop { .. }
                    | Commands::Restart { .. }
                    | Commands::Reindex { .. } => unreachable!(),
                }
            })
        }
    }
}
