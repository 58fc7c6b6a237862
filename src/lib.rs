//! # SMA - Modular Actor Data containers
//!
//! `sma-rs` reads and writes SMA containers: encrypted, owner-signed files
//! carrying a character's appearance (a Base) or override layers (Outfits
//! and Items), plus Descriptors that tie layers together into an actor.
//!
//! - **Tamper-evident**: the owner signs the immutable header fields, and the
//!   allow-list is bound to the payload as AEAD associated data
//! - **Capability tokens**: the owner can amend the allow-list offline
//! - **Content-addressed import**: packaged files are deduplicated against
//!   a local cache by SHA-256
//! - **Layer composition**: Base, Outfit and Items fold into one effective
//!   state per actor
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sma_rs::{ActorDataService, LocalFileCache, FileKeyProvider, SmaConfig, SmaKind, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let service = ActorDataService::new(
//!     Arc::new(LocalFileCache::open("cache")?),
//!     Arc::new(FileKeyProvider::new("owner.der")),
//!     SmaConfig::default(),
//! )?;
//!
//! // Export a Base
//! service
//!     .export(SmaKind::Base)
//!     .name("Everyday look")
//!     .add_bytes(b"texture bytes".to_vec(), vec!["chara/human/c0101/skin.tex".into()])
//!     .allow("peer-hash")
//!     .write("look.smab", "hunter2")?;
//!
//! // Import it again and compose an actor
//! let base = service.import_base("look.smab", "hunter2")?;
//! let actor = service.store().create_actor("Me", base)?;
//! let state = service.store().effective_state(actor)?;
//! println!("{}", state.glamour_json()?);
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    actor, cancel, compression, config, container, crypto, error, glamour, header, io, keys,
    metadata, registry, resolver, token,
};

pub use crate::core::{
    actor::{ActorBase, ActorItem, ActorOutfit, EffectiveState, LayerData, LocalFileInfo},
    cancel::CancelToken,
    compression::{BlockSize, CompressionConfig, FileSource, PackagedFile},
    config::SmaConfig,
    container::{OpenedContainer, SmaFile, TokenOutcome},
    error::{Rejection, Result, SmaError},
    glamour::{ApplyPart, EquipSlot, GlamourState, LayerFilter, MetaFilter, ModScope},
    header::{SmaHeader, SmaKind, FORMAT_VERSION},
    keys::{FileKeyProvider, OwnerKeyPair, OwnerKeyProvider},
    metadata::{DescriptorDocument, FileModData, FileSwap, LayerDocument, MetadataSummary},
    registry::{ActorDataStore, ActorRecord},
    resolver::{ContentResolver, FileCache, LocalFileCache, ResolveReport},
    token::UpdateToken,
};

use crate::core::container::SealParams;
use crate::core::header::check_allowed_entries;
use crate::core::resolver::HashLocks;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What an import registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imported {
    Base(Uuid),
    Outfit(Uuid),
    Item(Uuid),
    /// Actor created from a Descriptor
    Actor(Uuid),
}

/// A freshly written container
#[derive(Debug, Clone)]
pub struct Exported {
    pub file: SmaFile,
    pub header: SmaHeader,
}

/// Export/import service with constructor-supplied collaborators
///
/// Owns the layer registry; the file cache and owner key provider are
/// shared with the caller.
pub struct ActorDataService {
    key_provider: Arc<dyn OwnerKeyProvider>,
    config: SmaConfig,
    resolver: ContentResolver,
    store: ActorDataStore,
}

impl ActorDataService {
    /// Create a service; fails if `config` does not validate
    pub fn new(
        cache: Arc<dyn FileCache>,
        key_provider: Arc<dyn OwnerKeyProvider>,
        config: SmaConfig,
    ) -> Result<Self> {
        config.check()?;
        Ok(ActorDataService {
            key_provider,
            config,
            resolver: ContentResolver::with_locks(cache, Arc::new(HashLocks::new())),
            store: ActorDataStore::new(),
        })
    }

    pub fn config(&self) -> &SmaConfig {
        &self.config
    }

    pub fn store(&self) -> &ActorDataStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn FileCache> {
        self.resolver.cache()
    }

    /// Start building a container of `kind`
    pub fn export(&self, kind: SmaKind) -> ExportBuilder<'_> {
        ExportBuilder::new(self, kind)
    }

    /// Header of any container, without a password
    pub fn inspect<P: AsRef<Path>>(&self, path: P) -> Result<SmaHeader> {
        SmaFile::detect(path)?.read_header()
    }

    pub fn import_base<P: AsRef<Path>>(&self, path: P, password: &str) -> Result<Uuid> {
        let (data, _) =
            self.import_layer(path.as_ref(), SmaKind::Base, password, &CancelToken::new())?;
        self.store.insert_base(ActorBase { data })
    }

    pub fn import_outfit<P: AsRef<Path>>(&self, path: P, password: &str) -> Result<Uuid> {
        let (data, filter) =
            self.import_layer(path.as_ref(), SmaKind::Outfit, password, &CancelToken::new())?;
        let filter = require_filter(filter, SmaKind::Outfit)?;
        self.store.insert_outfit(ActorOutfit { data, filter })
    }

    pub fn import_item<P: AsRef<Path>>(&self, path: P, password: &str) -> Result<Uuid> {
        let (data, filter) =
            self.import_layer(path.as_ref(), SmaKind::Item, password, &CancelToken::new())?;
        let filter = require_filter(filter, SmaKind::Item)?;
        self.store.insert_item(ActorItem { data, filter })
    }

    /// Import a Descriptor; every layer it references must be imported
    /// already. Returns the new actor's id.
    pub fn import_descriptor<P: AsRef<Path>>(&self, path: P, password: &str) -> Result<Uuid> {
        let file = SmaFile::new(path, SmaKind::Descriptor);
        let opened = file.try_open(password, &self.config)?;
        let mut reader = opened.payload(self.config.chunk_size);
        let descriptor: DescriptorDocument = reader.read_metadata()?;
        reader.finish()?;
        self.store.create_actor_from_descriptor(&descriptor)
    }

    /// Import any container, dispatching on its magic
    pub fn import<P: AsRef<Path>>(
        &self,
        path: P,
        password: &str,
        cancel: &CancelToken,
    ) -> Result<Imported> {
        let path = path.as_ref();
        let kind = SmaFile::detect(path)?.kind();
        Ok(match kind {
            SmaKind::Descriptor => Imported::Actor(self.import_descriptor(path, password)?),
            SmaKind::Base => {
                let (data, _) = self.import_layer(path, kind, password, cancel)?;
                Imported::Base(self.store.insert_base(ActorBase { data })?)
            }
            SmaKind::Outfit => {
                let (data, filter) = self.import_layer(path, kind, password, cancel)?;
                let filter = require_filter(filter, kind)?;
                Imported::Outfit(self.store.insert_outfit(ActorOutfit { data, filter })?)
            }
            SmaKind::Item => {
                let (data, filter) = self.import_layer(path, kind, password, cancel)?;
                let filter = require_filter(filter, kind)?;
                Imported::Item(self.store.insert_item(ActorItem { data, filter })?)
            }
        })
    }

    fn import_layer(
        &self,
        path: &Path,
        kind: SmaKind,
        password: &str,
        cancel: &CancelToken,
    ) -> Result<(LayerData, Option<LayerFilter>)> {
        info!("Importing {} from {:?}", kind, path);
        let opened = SmaFile::new(path, kind).try_open(password, &self.config)?;
        let mut reader = opened.payload(self.config.chunk_size);
        let document: LayerDocument = reader.read_metadata()?;
        let (mod_dict, report) = self.resolver.resolve(&document, reader, cancel)?;
        debug!("Import of {} resolved: {:?}", opened.file_id(), report);

        let data = LayerData::new(opened.file_id(), document.summary, mod_dict);
        Ok((data, document.filter))
    }

    /// Issue a token for the container at `path`, signed with this
    /// service's owner key
    pub fn issue_token<P: AsRef<Path>>(
        &self,
        path: P,
        add_hashes: Vec<String>,
        remove_hashes: Vec<String>,
    ) -> Result<UpdateToken> {
        check_allowed_entries(&add_hashes)?;
        let header = self.inspect(path)?;
        let owner = self.key_provider.owner_key()?;
        if owner.public_key_spki()? != header.owner_pub_key {
            return Err(SmaError::Key(format!(
                "container {} is owned by a different key",
                header.file_id
            )));
        }
        Ok(UpdateToken::issue(
            &owner,
            header.file_id,
            add_hashes,
            remove_hashes,
            self.config.token_ttl(),
        ))
    }

    /// Apply a token to the container at `path` (password holder only)
    pub fn apply_token<P: AsRef<Path>>(
        &self,
        path: P,
        token: &UpdateToken,
        password: &str,
    ) -> Result<TokenOutcome> {
        SmaFile::detect(path)?.apply_token(token, password, &self.config)
    }
}

fn require_filter(filter: Option<LayerFilter>, kind: SmaKind) -> Result<LayerFilter> {
    filter.ok_or_else(|| SmaError::Malformed(format!("{} container has no layer filter", kind)))
}

#[cfg(feature = "async")]
impl ActorDataService {
    async fn run_blocking<T, F>(self: &Arc<Self>, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ActorDataService) -> Result<T> + Send + 'static,
    {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(service.as_ref()))
            .await
            .map_err(|e| SmaError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }

    pub async fn import_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        password: String,
        cancel: CancelToken,
    ) -> Result<Imported> {
        self.run_blocking(move |service| service.import(&path, &password, &cancel))
            .await
    }

    pub async fn import_base_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        password: String,
    ) -> Result<Uuid> {
        self.run_blocking(move |service| service.import_base(&path, &password))
            .await
    }

    pub async fn import_outfit_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        password: String,
    ) -> Result<Uuid> {
        self.run_blocking(move |service| service.import_outfit(&path, &password))
            .await
    }

    pub async fn import_item_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        password: String,
    ) -> Result<Uuid> {
        self.run_blocking(move |service| service.import_item(&path, &password))
            .await
    }

    pub async fn import_descriptor_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        password: String,
    ) -> Result<Uuid> {
        self.run_blocking(move |service| service.import_descriptor(&path, &password))
            .await
    }

    pub async fn apply_token_async(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        token: UpdateToken,
        password: String,
    ) -> Result<TokenOutcome> {
        self.run_blocking(move |service| service.apply_token(&path, &token, &password))
            .await
    }
}

/// Builder for exported containers
///
/// # Examples
///
/// ```rust,no_run
/// use sma_rs::{ActorDataService, EquipSlot, LayerFilter, SmaKind};
///
/// # fn demo(service: &ActorDataService) -> sma_rs::Result<()> {
/// service
///     .export(SmaKind::Item)
///     .name("Straw hat")
///     .filter(LayerFilter::equipment([EquipSlot::Head]))
///     .add_path("hat.mdl", vec!["chara/equipment/e0100/model/c0101e0100_met.mdl".into()])?
///     .write("hat.smai", "secret")?;
/// # Ok(())
/// # }
/// ```
pub struct ExportBuilder<'a> {
    service: &'a ActorDataService,
    kind: SmaKind,
    summary: MetadataSummary,
    filter: Option<LayerFilter>,
    descriptor: Option<DescriptorDocument>,
    files: Vec<PackagedFile>,
    allowed_hashes: Vec<String>,
    register: bool,
    cancel: CancelToken,
}

impl<'a> ExportBuilder<'a> {
    fn new(service: &'a ActorDataService, kind: SmaKind) -> Self {
        ExportBuilder {
            service,
            kind,
            summary: MetadataSummary::default(),
            filter: None,
            descriptor: None,
            files: Vec::new(),
            allowed_hashes: Vec::new(),
            register: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.summary.name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.summary.description = description.into();
        self
    }

    pub fn glamour(mut self, state: GlamourState) -> Self {
        self.summary.glamour_state = state;
        self
    }

    /// Set one equipment slot of the glamour snapshot
    pub fn equip(mut self, slot: EquipSlot, value: Value) -> Self {
        self.summary.glamour_state.equipment.insert(slot, value);
        self
    }

    pub fn manipulations(mut self, manipulations: impl Into<String>) -> Self {
        self.summary.manipulation_string = manipulations.into();
        self
    }

    pub fn customize_profile(mut self, profile: impl Into<String>) -> Self {
        self.summary.customize_data = profile.into();
        self
    }

    /// Filter for Outfit and Item exports (required for those kinds)
    pub fn filter(mut self, filter: LayerFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Actor record for Descriptor exports
    pub fn descriptor(mut self, descriptor: DescriptorDocument) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Add a file; identical content is packaged once with merged game paths
    pub fn add_file(mut self, file: PackagedFile) -> Self {
        match self
            .files
            .iter_mut()
            .find(|f| f.entry.content_hash == file.entry.content_hash)
        {
            Some(existing) => {
                for path in file.entry.game_paths {
                    if !existing.entry.game_paths.contains(&path) {
                        existing.entry.game_paths.push(path);
                    }
                }
            }
            None => self.files.push(file),
        }
        self
    }

    pub fn add_bytes(self, bytes: Vec<u8>, game_paths: Vec<String>) -> Self {
        self.add_file(PackagedFile::from_bytes(bytes, game_paths))
    }

    pub fn add_path<P: AsRef<Path>>(self, path: P, game_paths: Vec<String>) -> Result<Self> {
        Ok(self.add_file(PackagedFile::from_path(path, game_paths)?))
    }

    pub fn swap(mut self, game_paths: Vec<String>, target: impl Into<String>) -> Self {
        self.summary.swaps.push(FileSwap {
            game_paths,
            swap_target_path: target.into(),
        });
        self
    }

    /// Add a hash to the initial allow-list
    pub fn allow(mut self, hash: impl Into<String>) -> Self {
        self.allowed_hashes.push(hash.into());
        self
    }

    pub fn allow_all<I, S>(mut self, hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hashes.extend(hashes.into_iter().map(Into::into));
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Also register the exported layer in the service's store, marked as
    /// local, with game paths mapped to the source files on disk. Files added
    /// from memory are written to the cache first.
    pub fn register_locally(mut self) -> Self {
        self.register = true;
        self
    }

    /// Seal and write the container
    pub fn write<P: AsRef<Path>>(self, path: P, password: &str) -> Result<Exported> {
        let owner = self.service.key_provider.owner_key()?;
        let config = &self.service.config;
        let params = SealParams {
            password,
            owner: &owner,
            allowed_hashes: self.allowed_hashes.clone(),
            config,
            cancel: &self.cancel,
        };

        if self.kind == SmaKind::Descriptor {
            let descriptor = self.descriptor.as_ref().ok_or_else(|| {
                SmaError::Malformed("descriptor export requires an actor record".into())
            })?;
            if !self.files.is_empty() {
                return Err(SmaError::Malformed("descriptors package no files".into()));
            }
            let (file, header) = SmaFile::export(path, self.kind, descriptor, &[], params)?;
            return Ok(Exported { file, header });
        }

        let filter = match self.kind {
            SmaKind::Base => None,
            kind => Some(
                self.filter
                    .clone()
                    .ok_or_else(|| SmaError::Malformed(format!("{} export requires a layer filter", kind)))?,
            ),
        };

        let mut summary = self.summary.clone();
        summary.files = self.files.iter().map(|f| f.entry.clone()).collect();
        let document = LayerDocument { summary, filter };

        let (file, header) = SmaFile::export(path, self.kind, &document, &self.files, params)?;

        if self.register {
            self.register_export(&file, &header, document)?;
        }
        Ok(Exported { file, header })
    }

    fn register_export(&self, file: &SmaFile, header: &SmaHeader, document: LayerDocument) -> Result<()> {
        let mut mod_dict = BTreeMap::new();
        for packaged in &self.files {
            let source = match &packaged.source {
                FileSource::Path(source) => source.clone(),
                FileSource::Bytes(bytes) => self.service.resolver.store_bytes(&packaged.entry, bytes)?,
            };
            let source = source.to_string_lossy().into_owned();
            for game_path in &packaged.entry.game_paths {
                mod_dict.insert(game_path.clone(), source.clone());
            }
        }
        for swap in &document.summary.swaps {
            for game_path in &swap.game_paths {
                mod_dict.insert(game_path.clone(), swap.swap_target_path.clone());
            }
        }

        let data = LayerData::new(header.file_id, document.summary, mod_dict)
            .with_local(LocalFileInfo::new(file.path().to_path_buf()));
        let store = &self.service.store;
        match (self.kind, document.filter) {
            (SmaKind::Base, _) => store.insert_base(ActorBase { data })?,
            (SmaKind::Outfit, Some(filter)) => store.insert_outfit(ActorOutfit { data, filter })?,
            (SmaKind::Item, Some(filter)) => store.insert_item(ActorItem { data, filter })?,
            (kind, _) => return Err(SmaError::Malformed(format!("cannot register a {} locally", kind))),
        };
        Ok(())
    }
}
