//! Mount state: the pinned lower instance, the root entry and the working
//! triad, plus the superblock-level operations.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Result, StackError};
use crate::lower::{ActivePin, FsInstance, LowerFs, LowerKind, LowerPath};
use crate::shadow::{NodeCache, ShadowEntry, ShadowNode};
use crate::stats::AdapterStats;
use crate::types::{FileId, MountOptions, RemountFlags, StatFs};
use crate::workdir::{self, WorkTriad};

/// `statfs` magic reported by stackfs mounts ("STKF").
pub const STACKFS_SUPER_MAGIC: u64 = 0x5354_4b46;

/// State of one mount.
pub struct Superblock {
    id: Uuid,
    lower: Arc<dyn LowerFs>,
    instance: Arc<FsInstance>,
    pin: Mutex<Option<ActivePin>>,
    cache: NodeCache,
    root: RwLock<Option<Arc<ShadowEntry>>>,
    work: RwLock<Option<WorkTriad>>,
    options: RwLock<MountOptions>,
    stats: Arc<AdapterStats>,
}

impl Superblock {
    /// Mounts over the host directory named by `source`.
    #[cfg(target_os = "linux")]
    pub fn mount(source: Option<&str>, options: MountOptions) -> Result<Arc<Self>> {
        let source = match source {
            Some(source) if !source.is_empty() => source,
            _ => {
                tracing::error!("missing lower directory argument");
                return Err(StackError::invalid("no lower directory given"));
            }
        };
        let lower = crate::lower::host::HostLower::open(std::path::Path::new(source))?;
        Self::attach(lower, options)
    }

    /// Pins `lower`, validates its kind and bootstraps the working triad.
    ///
    /// A failure releases everything taken so far before returning.
    pub fn attach(lower: Arc<dyn LowerFs>, options: MountOptions) -> Result<Arc<Self>> {
        let instance = Arc::clone(lower.instance());
        let stats = Arc::new(AdapterStats::new());
        let sb = Arc::new(Self {
            id: Uuid::new_v4(),
            pin: Mutex::new(Some(instance.pin_active())),
            instance,
            cache: NodeCache::new(Arc::clone(&stats)),
            root: RwLock::new(None),
            work: RwLock::new(None),
            options: RwLock::new(options),
            stats,
            lower,
        });

        if let Err(e) = sb.init() {
            sb.detach();
            return Err(e);
        }
        let banner = format!(
            "mount {} attached to {} ({}, {})",
            sb.id,
            sb.lower.source().display(),
            sb.instance.fs_type(),
            if sb.lower.kind().is_overlay() { "overlay" } else { "plain" }
        );
        if sb.options.read().silent {
            tracing::debug!("{}", banner);
        } else {
            tracing::info!("{}", banner);
        }
        Ok(sb)
    }

    fn init(&self) -> Result<()> {
        let options = self.options.read().clone();
        let work_layer = self.work_layer(&options)?;

        let root_path = LowerPath::root_of(Arc::clone(&self.lower))?;
        let root = self.root_entry(root_path)?;
        let work_root = match work_layer {
            Some(upper_root) => self.root_entry(upper_root)?,
            None => Arc::clone(&root),
        };

        let triad = workdir::bootstrap(&self.cache, &work_root, &options)?;
        tracing::debug!("mount {} working triad: {:?}", self.id, triad.lower_paths());
        *self.root.write() = Some(root);
        *self.work.write() = Some(triad);
        Ok(())
    }

    fn root_entry(&self, path: LowerPath) -> Result<Arc<ShadowEntry>> {
        let inode = path
            .inode()
            .ok_or_else(|| StackError::stale("lower root is negative"))?;
        let node = self.cache.find_or_create(&inode)?;
        Ok(ShadowEntry::new_root(path, node))
    }

    /// Picks where the triad goes: the writable upper layer of an overlay,
    /// or `None` for the lower root itself.
    fn work_layer(&self, options: &MountOptions) -> Result<Option<LowerPath>> {
        match self.lower.kind() {
            LowerKind::Overlay(layout) => {
                let upper = match (&layout.upper, &layout.work_dir) {
                    (Some(upper), Some(_)) => Arc::clone(upper),
                    _ => {
                        tracing::error!("read-only overlay lower {} is not supported", self.lower.source().display());
                        return Err(StackError::invalid("read-only overlay lower"));
                    }
                };
                if !layout.work_dir_present {
                    let work = layout.work_dir.as_deref().map(|p| p.display().to_string()).unwrap_or_default();
                    tracing::error!("overlay lower has a work directory {}, but it disappeared", work);
                    return Err(StackError::UnsupportedLower {
                        reason: format!("overlay work directory {} is gone", work),
                    });
                }
                Ok(Some(LowerPath::root_of(upper)?))
            }
            LowerKind::Plain if options.require_overlay => {
                tracing::error!(
                    "{} is a {} filesystem, an overlay lower is required",
                    self.lower.source().display(),
                    self.instance.fs_type()
                );
                Err(StackError::UnsupportedLower {
                    reason: format!("{} is not an overlay", self.instance.fs_type()),
                })
            }
            LowerKind::Plain => Ok(None),
        }
    }

    /// Releases the instance pin and the stored root and triad.
    ///
    /// Idempotent: only the first call releases anything. Returns whether
    /// this call did.
    pub fn detach(&self) -> bool {
        let Some(pin) = self.pin.lock().take() else {
            return false;
        };
        let work = self.work.write().take();
        let root = self.root.write().take();
        drop(work);
        drop(root);
        drop(pin);
        tracing::info!("mount {} detached from {}", self.id, self.lower.source().display());
        true
    }

    pub fn is_attached(&self) -> bool {
        self.pin.lock().is_some()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lower(&self) -> &Arc<dyn LowerFs> {
        &self.lower
    }

    pub fn instance(&self) -> &Arc<FsInstance> {
        &self.instance
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<AdapterStats> {
        &self.stats
    }

    pub fn options(&self) -> MountOptions {
        self.options.read().clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read().read_only
    }

    /// Largest file size, inherited from the lower instance.
    pub fn max_bytes(&self) -> u64 {
        self.instance.max_bytes()
    }

    pub fn time_gran(&self) -> std::time::Duration {
        self.instance.time_gran()
    }

    pub fn root(&self) -> Result<Arc<ShadowEntry>> {
        self.root
            .read()
            .clone()
            .ok_or_else(|| StackError::stale("mount is detached"))
    }

    pub fn work(&self) -> Option<WorkTriad> {
        self.work.read().clone()
    }

    /// Forwards to the lower root, reporting the stackfs magic.
    pub fn statfs(&self) -> Result<StatFs> {
        let root = self.root()?;
        let inode = root
            .get_lower_path()
            .and_then(|path| path.inode())
            .ok_or_else(|| StackError::stale("root has no lower path"))?;
        let mut st = self.lower.statfs(&inode)?;
        st.fs_type = STACKFS_SUPER_MAGIC;
        Ok(st)
    }

    /// Applies remount flags. Only read-only, mandatory-lock and silent are
    /// accepted.
    pub fn remount(&self, flags: RemountFlags) -> Result<()> {
        let unsupported = flags.unsupported();
        if unsupported != 0 {
            tracing::error!("remount: unsupported flags {:#x}", unsupported);
            return Err(StackError::invalid(format!("remount flags {:#x}", unsupported)));
        }
        let mut options = self.options.write();
        options.read_only = flags.contains(RemountFlags::READ_ONLY);
        options.silent = flags.contains(RemountFlags::SILENT);
        tracing::info!(
            "mount {} remounted {}",
            self.id,
            if options.read_only { "ro" } else { "rw" }
        );
        Ok(())
    }

    /// Tells the lower filesystem a forced unmount has begun.
    pub fn umount_begin(&self) {
        tracing::debug!("mount {} umount_begin", self.id);
        self.lower.umount_begin();
    }

    /// Mount options as shown in the mount table.
    pub fn show_options(&self) -> String {
        let mut parts = vec![format!("lower={}", self.lower.source().display())];
        parts.extend(self.options.read().non_default_options());
        parts.join(",")
    }

    /// Resolves an export handle to a node.
    ///
    /// Only lower nodes that are still live are found. A zero generation
    /// matches any node, since not every lower filesystem exposes one.
    pub fn node_from_handle(&self, id: FileId) -> Result<Arc<ShadowNode>> {
        let inode = self
            .lower
            .inode_by_ino(id.ino)
            .ok_or_else(|| StackError::stale(format!("no live lower node for handle {}", id)))?;
        if id.generation != 0 && inode.generation() != 0 && inode.generation() != id.generation {
            return Err(StackError::stale(format!(
                "handle {} has generation {}, node has {}",
                id,
                id.generation,
                inode.generation()
            )));
        }
        self.cache.find_or_create(&inode)
    }
}

impl Drop for Superblock {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("id", &self.id)
            .field("lower", &self.lower.source())
            .field("attached", &self.is_attached())
            .finish()
    }
}
