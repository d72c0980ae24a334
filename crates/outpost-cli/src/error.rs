use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{err:#}").to_lowercase();

    let socket_missing = msg.contains("no such file") || msg.contains("connection refused");
    if msg.contains("connect to") && socket_missing {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The agent service does not appear to be running. Start it with:");
        eprintln!("  {} outpost service", "$".dimmed());
    }

    if msg.contains("permission denied") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The broker socket and helper spawning need elevated privileges.");
        eprintln!(
            "  Run the service as root, or set {} to a writable path.",
            "OUTPOST_SOCKET".bold()
        );
    }

    if msg.contains("auth rejected") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The service refused this helper. Check the service log for the reason.");
    }

    std::process::exit(1);
}
