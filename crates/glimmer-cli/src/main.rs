//! Entry point for the `glimmer` binary. Setup (error reporting, logging)
//! lives here; all the actual command logic is in `glimmer_cli::run`.

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = glimmer_cli::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    Ok(())
}
