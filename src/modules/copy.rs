// Copy module - install a local file, skipping the write when content matches

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ArgField, BoundArgs, Builtin, Command};
use crate::executor::{CommandEnv, TaskOutput};
use crate::output::errors::{BindError, CommandError};
use crate::parser::ast::{Value, Vars};

const COPY_FIELDS: &[ArgField] = &[ArgField::required("src"), ArgField::required("dest")];

/// Distinguishes temp files of concurrent copies within one process
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Factory for `copy`
pub struct CopyBuiltin;

impl Builtin for CopyBuiltin {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn fields(&self) -> &'static [ArgField] {
        COPY_FIELDS
    }

    fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError> {
        Ok(Arc::new(CopyCmd {
            src: PathBuf::from(args.string("src")?),
            dest: PathBuf::from(args.string("dest")?),
        }))
    }
}

pub struct CopyCmd {
    src: PathBuf,
    dest: PathBuf,
}

#[async_trait]
impl Command for CopyCmd {
    async fn run(&self, _env: &CommandEnv, _args: &str) -> Result<TaskOutput, CommandError> {
        let src_meta = fs::metadata(&self.src)
            .await
            .map_err(|e| CommandError::path(&self.src, e))?;
        let dest = self.resolve_dest().await?;

        let content = fs::read(&self.src)
            .await
            .map_err(|e| CommandError::path(&self.src, e))?;
        let digest = sha256_hex(&content);

        let mut data = Vars::new();
        data.insert("sha256".to_string(), Value::String(digest.clone()));
        data.insert("src".to_string(), Value::String(self.src.display().to_string()));
        data.insert("dest".to_string(), Value::String(dest.display().to_string()));

        if let Ok(existing) = fs::read(&dest).await {
            if sha256_hex(&existing) == digest {
                debug!(dest = %dest.display(), "destination already up to date");
                return Ok(TaskOutput::wrap(false, data));
            }
        }

        let tmp = temp_path(&dest);
        if let Err(e) = install(&tmp, &dest, &content, &src_meta).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        Ok(TaskOutput::wrap(true, data))
    }
}

impl CopyCmd {
    /// A directory destination receives the file under the source's name
    async fn resolve_dest(&self) -> Result<PathBuf, CommandError> {
        match fs::metadata(&self.dest).await {
            Ok(meta) if meta.is_dir() => {
                let name = self.src.file_name().ok_or_else(|| {
                    CommandError::Failed(format!(
                        "cannot copy '{}' into a directory: no file name",
                        self.src.display()
                    ))
                })?;
                Ok(self.dest.join(name))
            }
            _ => Ok(self.dest.clone()),
        }
    }
}

/// Write `content` next to `dest` and rename it into place
async fn install(
    tmp: &Path,
    dest: &Path,
    content: &[u8],
    src_meta: &std::fs::Metadata,
) -> Result<(), CommandError> {
    // Source mode from creation; umask can still narrow it, hence the chmod.
    let mode = src_meta.permissions().mode() & 0o7777;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(tmp)
        .await
        .map_err(|e| CommandError::path(tmp, e))?;
    file.write_all(content)
        .await
        .map_err(|e| CommandError::path(tmp, e))?;
    file.flush().await.map_err(|e| CommandError::path(tmp, e))?;
    drop(file);

    fs::set_permissions(tmp, src_meta.permissions())
        .await
        .map_err(|e| CommandError::path(tmp, e))?;

    // Ownership only transfers when running privileged.
    if let Err(e) = std::os::unix::fs::chown(tmp, Some(src_meta.uid()), Some(src_meta.gid())) {
        debug!(path = %tmp.display(), error = %e, "could not replicate ownership");
    }

    if let Ok(meta) = fs::symlink_metadata(dest).await {
        if meta.file_type().is_symlink() {
            warn!(dest = %dest.display(), "replacing symlink at destination");
            fs::remove_file(dest)
                .await
                .map_err(|e| CommandError::path(dest, e))?;
        }
    }

    fs::rename(tmp, dest)
        .await
        .map_err(|e| CommandError::path(dest, e))
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".tmp.{}.{}", std::process::id(), seq));
    PathBuf::from(name)
}

fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
