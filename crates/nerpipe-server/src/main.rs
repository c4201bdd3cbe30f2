use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nerpipe_local::{dictfile::DictFormat, html::SnippetReader, visible_text};
use nerpipe_server::config::{CacheType, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "nerpipe")]
#[command(about = "Named-entity recognition over HTML documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server.
    Serve(ServeCmd),
    /// Load dictionary files into the configured remote cache.
    Import(ImportCmd),
    /// Print the visible text of an HTML file.
    Text(FileCmd),
    /// Print the tokens of an HTML file (json).
    Tokens(TokensCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Path to configuration file (TOML).
    #[arg(short, long, env = "NERPIPE_CONFIG")]
    config: Option<PathBuf>,
    /// HTTP listen address (overrides config file).
    #[arg(long, env = "NERPIPE_BIND")]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ImportCmd {
    /// Path to configuration file (TOML); selects the cache to write to.
    #[arg(short, long, env = "NERPIPE_CONFIG")]
    config: Option<PathBuf>,
    /// Input format: pubchem|leadmine
    #[arg(long, default_value = "leadmine")]
    format: DictFormat,
    /// Dictionary name stored with every entry.
    #[arg(long)]
    dictionary: String,
    /// Entries per cache round trip (overrides config file).
    #[arg(long)]
    pipeline_size: Option<usize>,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct FileCmd {
    file: PathBuf,
}

#[derive(clap::Args, Debug)]
struct TokensCmd {
    file: PathBuf,
    /// Keep punctuated compounds as single tokens.
    #[arg(long)]
    exact_match: bool,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn read_html(path: &Path) -> Result<Vec<nerpipe_core::Snippet>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let snippets = SnippetReader::new(std::io::BufReader::new(file))
        .collect::<nerpipe_core::Result<Vec<_>>>()
        .with_context(|| format!("read {}", path.display()))?;
    Ok(snippets)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    nerpipe_server::init_tracing();

    match cli.command {
        Commands::Serve(args) => {
            let mut config = Config::load(args.config.as_deref())?;
            if let Some(bind) = args.bind {
                config.bind = bind;
            }
            let state = nerpipe_server::build_state(config).await?;
            nerpipe_server::serve(state).await?;
        }
        Commands::Import(args) => {
            let mut config = Config::load(args.config.as_deref())?;
            if let Some(size) = args.pipeline_size {
                config.pipeline_size = size;
            }
            config.validate()?;
            if config.cache_type()? == CacheType::Elasticsearch {
                nerpipe_server::elastic_cache(&config)?.create_index().await?;
            }
            let Some(cache) = nerpipe_server::remote_cache(&config).await? else {
                bail!("import needs cache_type = \"redis\" or \"elasticsearch\"; local dictionaries load from [[dictionary]] files at startup");
            };
            let summary = nerpipe_server::import_files(
                &args.files,
                args.format,
                &args.dictionary,
                Arc::as_ref(&cache),
                config.pipeline_size,
            )
            .await?;
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "import",
                "ok": true,
                "dictionary": args.dictionary,
                "cache": cache.name(),
                "files": args.files.len(),
                "entries": summary.entries,
                "keys": summary.keys,
            });
            println!("{v}");
        }
        Commands::Text(args) => {
            print!("{}", visible_text(&read_html(&args.file)?));
        }
        Commands::Tokens(args) => {
            let snippets = read_html(&args.file)?;
            let tokens = nerpipe_server::routes::tokens(&snippets, args.exact_match);
            println!("{}", serde_json::to_string(&tokens)?);
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "nerpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("nerpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
