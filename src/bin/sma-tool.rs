//! SMA container tool
//!
//! Create, inspect, open and import SMA containers, and issue or apply
//! allow-list update tokens.

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sma_rs::{
    ActorDataService, ApplyPart, CancelToken, DescriptorDocument, EquipSlot, FileKeyProvider,
    GlamourState, Imported, LayerDocument, LayerFilter, LocalFileCache, MetaFilter,
    OwnerKeyProvider, SmaConfig, SmaFile, SmaKind, TokenOutcome, UpdateToken,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "sma-tool")]
#[command(about = "Create and manage Modular Actor Data (SMA) containers")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Owner key (PKCS#8 DER), used when exporting or issuing tokens
    #[arg(short, long, global = true, default_value = "sma-owner.der")]
    key: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an owner key
    Keygen {
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Package files into a new container
    Export(ExportArgs),

    /// Print a container header (no password needed)
    Inspect { path: PathBuf },

    /// Decrypt a container and print its metadata
    Open {
        path: PathBuf,
        #[arg(short, long)]
        password: String,
    },

    /// Resolve containers into the file cache and compose actors
    Import {
        paths: Vec<PathBuf>,
        #[arg(short, long)]
        password: String,
        /// Cache directory (defaults to `cache_dir` from the config)
        #[arg(long)]
        cache: Option<PathBuf>,
    },

    /// Issue an allow-list update token for a container
    IssueToken {
        path: PathBuf,
        #[arg(long = "add")]
        add: Vec<String>,
        #[arg(long = "remove")]
        remove: Vec<String>,
        /// Token file to write
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Apply an update token to a container
    ApplyToken {
        path: PathBuf,
        #[arg(short, long)]
        token: PathBuf,
        #[arg(short, long)]
        password: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Base,
    Outfit,
    Item,
    Descriptor,
}

impl From<KindArg> for SmaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Base => SmaKind::Base,
            KindArg::Outfit => SmaKind::Outfit,
            KindArg::Item => SmaKind::Item,
            KindArg::Descriptor => SmaKind::Descriptor,
        }
    }
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long, value_enum)]
    kind: KindArg,

    /// Output path; the extension defaults to the kind's
    #[arg(short, long)]
    out: PathBuf,

    #[arg(short, long)]
    password: String,

    #[arg(long, default_value = "")]
    name: String,

    #[arg(long, default_value = "")]
    description: String,

    /// Packaged file as GAME_PATH=LOCAL_PATH (repeatable)
    #[arg(long = "file", value_parser = parse_pair)]
    files: Vec<(String, String)>,

    /// File swap as GAME_PATH=TARGET_GAME_PATH (repeatable)
    #[arg(long = "swap", value_parser = parse_pair)]
    swaps: Vec<(String, String)>,

    /// Initial allow-list entry (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Glamour state JSON file
    #[arg(long)]
    glamour: Option<PathBuf>,

    #[arg(long)]
    manipulations: Option<String>,

    #[arg(long)]
    customize_profile: Option<String>,

    /// Slots an Outfit/Item may override (repeatable)
    #[arg(long = "slot", value_parser = parse_slot)]
    slots: Vec<EquipSlot>,

    /// Parts an Outfit/Item may override (repeatable)
    #[arg(long = "part", value_parser = parse_part)]
    parts: Vec<ApplyPart>,

    /// Let the layer replace the manipulation string
    #[arg(long)]
    meta_manipulations: bool,

    /// Let the layer replace the customize profile
    #[arg(long)]
    meta_customize: bool,

    /// Descriptor: base layer file id
    #[arg(long)]
    base: Option<Uuid>,

    /// Descriptor: available outfit file id (repeatable)
    #[arg(long = "outfit")]
    outfits: Vec<Uuid>,

    /// Descriptor: available item file id (repeatable)
    #[arg(long = "item")]
    items: Vec<Uuid>,

    #[arg(long)]
    selected_outfit: Option<Uuid>,

    #[arg(long = "selected-item")]
    selected_items: Vec<Uuid>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn parse_slot(s: &str) -> Result<EquipSlot, String> {
    EquipSlot::ALL
        .into_iter()
        .find(|slot| format!("{:?}", slot).eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown slot '{}'", s))
}

fn parse_part(s: &str) -> Result<ApplyPart, String> {
    ApplyPart::ALL
        .into_iter()
        .find(|part| format!("{:?}", part).eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown part '{}'", s))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => SmaConfig::load(path)
            .with_context(|| format!("loading config from {:?}", path))?,
        None => SmaConfig::default(),
    };

    match cli.command {
        Command::Keygen { force } => keygen(&cli.key, force),
        Command::Export(args) => export(&cli.key, config, args),
        Command::Inspect { path } => inspect(&path),
        Command::Open { path, password } => open(&path, &password, &config),
        Command::Import {
            paths,
            password,
            cache,
        } => import(&cli.key, config, cache, &paths, &password),
        Command::IssueToken {
            path,
            add,
            remove,
            out,
        } => {
            let service = service(&cli.key, config, None)?;
            let token = service.issue_token(&path, add, remove)?;
            token.save(&out)?;
            info!("Token for {} written to {:?}", token.payload.file_id, out);
            let expires = token
                .payload
                .expires_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "out of range".to_string());
            println!("{} (expires {})", out.display(), expires);
            Ok(())
        }
        Command::ApplyToken {
            path,
            token,
            password,
        } => {
            let token = UpdateToken::load(&token)
                .with_context(|| format!("reading token {:?}", token))?;
            let file = SmaFile::detect(&path)?;
            match file.apply_token(&token, &password, &config)? {
                TokenOutcome::Unchanged => println!("already applied"),
                TokenOutcome::Updated(allowed) => {
                    println!("allowed hashes: {}", allowed.join(", "))
                }
            }
            Ok(())
        }
    }
}

fn service(
    key: &Path,
    config: SmaConfig,
    cache: Option<PathBuf>,
) -> anyhow::Result<ActorDataService> {
    let cache_dir = cache
        .or_else(|| config.cache_dir.clone())
        .unwrap_or_else(|| std::env::temp_dir().join("sma-cache"));
    let cache = LocalFileCache::open(&cache_dir)
        .with_context(|| format!("opening cache {:?}", cache_dir))?;
    Ok(ActorDataService::new(
        Arc::new(cache),
        Arc::new(FileKeyProvider::new(key)),
        config,
    )?)
}

fn keygen(key: &Path, force: bool) -> anyhow::Result<()> {
    if key.exists() {
        if !force {
            bail!("{:?} already exists (use --force to replace it)", key);
        }
        std::fs::remove_file(key)?;
    }
    let owner = FileKeyProvider::new(key).owner_key()?;
    println!("{}", fingerprint(&owner.public_key_spki()?));
    Ok(())
}

fn export(key: &Path, config: SmaConfig, args: ExportArgs) -> anyhow::Result<()> {
    let service = service(key, config, None)?;
    let kind = SmaKind::from(args.kind);

    let mut out = args.out.clone();
    if out.extension().is_none() {
        out.set_extension(kind.extension());
    }

    let mut builder = service
        .export(kind)
        .name(&args.name)
        .description(&args.description)
        .allow_all(args.allow);

    if kind == SmaKind::Descriptor {
        let base = args
            .base
            .ok_or_else(|| anyhow!("--base is required for descriptors"))?;
        builder = builder.descriptor(DescriptorDocument {
            name: args.name.clone(),
            base,
            outfits: args.outfits,
            items: args.items,
            selected_outfit: args.selected_outfit,
            selected_items: args.selected_items,
        });
    } else {
        for (game_path, local) in args.files {
            builder = builder
                .add_path(&local, vec![game_path])
                .with_context(|| format!("reading {}", local))?;
        }
        for (game_path, target) in args.swaps {
            builder = builder.swap(vec![game_path], target);
        }
        if let Some(path) = &args.glamour {
            let text = std::fs::read_to_string(path)?;
            let state: GlamourState = serde_json::from_str(&text)
                .with_context(|| format!("parsing glamour state {:?}", path))?;
            builder = builder.glamour(state);
        }
        if let Some(manipulations) = args.manipulations {
            builder = builder.manipulations(manipulations);
        }
        if let Some(profile) = args.customize_profile {
            builder = builder.customize_profile(profile);
        }
        if kind != SmaKind::Base {
            let mut filter = LayerFilter::default().with_meta(MetaFilter {
                manipulations: args.meta_manipulations,
                customize_profile: args.meta_customize,
            });
            filter.slots.extend(args.slots);
            filter.parts.extend(args.parts);
            if !filter.slots.is_empty() {
                filter.parts.insert(ApplyPart::Equipment);
            }
            builder = builder.filter(filter);
        }
    }

    let exported = builder.write(&out, &args.password)?;
    println!("{} {}", exported.header.file_id, out.display());
    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let file = SmaFile::detect(path)?;
    let header = file.read_header()?;
    println!("kind:        {}", file.kind());
    println!("version:     {}", header.version);
    println!("file id:     {}", header.file_id);
    println!("owner:       {}", fingerprint(&header.owner_pub_key));
    println!("allowed:     {}", header.allowed_hashes.join(", "));
    Ok(())
}

fn open(path: &Path, password: &str, config: &SmaConfig) -> anyhow::Result<()> {
    let file = SmaFile::detect(path)?;
    let opened = file.try_open(password, config)?;
    let json = if file.kind() == SmaKind::Descriptor {
        serde_json::to_string_pretty(&opened.read_metadata::<DescriptorDocument>()?)?
    } else {
        serde_json::to_string_pretty(&opened.read_metadata::<LayerDocument>()?)?
    };
    println!("{}", json);
    Ok(())
}

fn import(
    key: &Path,
    config: SmaConfig,
    cache: Option<PathBuf>,
    paths: &[PathBuf],
    password: &str,
) -> anyhow::Result<()> {
    let service = service(key, config, cache)?;
    let cancel = CancelToken::new();

    // Layers first so descriptors can reference them
    let mut ordered = Vec::with_capacity(paths.len());
    for path in paths {
        ordered.push((SmaFile::detect(path)?.kind(), path));
    }
    ordered.sort_by_key(|(kind, _)| *kind == SmaKind::Descriptor);

    for (_, path) in ordered {
        let imported = service
            .import(path, password, &cancel)
            .with_context(|| format!("importing {:?}", path))?;
        match imported {
            Imported::Actor(actor) => {
                let state = service.store().effective_state(actor)?;
                println!("actor {}: {} mods", actor, state.mod_dict.len());
                println!("{}", state.glamour_json()?);
            }
            other => println!("{:?} <- {}", other, path.display()),
        }
    }
    Ok(())
}

fn fingerprint(spki: &[u8]) -> String {
    hex::encode(&Sha256::digest(spki)[..16])
}
