use crate::pool::BufferPool;
use log::{info, warn};
use std::path::{Component, Path, PathBuf};
use tftp_transfer::{
    receive_file, send_file, ErrorCode, FileBuffer, Opcode, TransferConfig, TransferEndpoint,
};

/// How requested filenames map to files on disk.
#[derive(Clone, Debug)]
pub struct FilePolicy {
    /// Canonicalized directory every request is resolved inside.
    pub root: PathBuf,
    /// Whether write requests may create new files.
    pub create: bool,
    /// Whether write requests to existing files are refused instead of
    /// truncating.
    pub no_clobber: bool,
}

/// Runs one accepted transfer to completion.
///
/// Failures on the initial path (bad filename, unopenable file) are
/// reported to the peer with the nearest error code; failures mid-transfer
/// are only logged, since the engine has already dealt with the peer.
pub async fn handle_transfer(
    mut endpoint: TransferEndpoint,
    config: TransferConfig,
    policy: FilePolicy,
    pool: BufferPool,
) {
    let peer = endpoint.peer();
    let opcode = endpoint.opcode();
    let filename = endpoint.request().filename.clone();
    info!("{opcode:?} for {filename:?} from {peer}");

    let Some(mut buffer) = open_requested_file(&endpoint, &policy, &pool).await else {
        return;
    };

    let result = match opcode {
        Opcode::Rrq => send_file(&mut endpoint, &mut buffer, &config).await,
        _ => receive_file(&mut endpoint, &mut buffer, &config).await,
    };

    match result {
        Ok(()) => {
            info!("{opcode:?} for {filename:?} from {peer} complete");
            // only read views go back in the pool: a write view's file was
            // truncated for this transfer and can't be handed to the next
            if opcode == Opcode::Rrq {
                pool.check_in(buffer);
            }
        }
        Err(err) => warn!("{opcode:?} for {filename:?} from {peer} failed: {err}"),
    }
}

/// Resolves and opens the requested file, pulling an idle view from the
/// pool when one matches. On failure the peer has been sent an error
/// packet and `None` is returned.
async fn open_requested_file(
    endpoint: &TransferEndpoint,
    policy: &FilePolicy,
    pool: &BufferPool,
) -> Option<FileBuffer> {
    let filename = &endpoint.request().filename;
    let Some(path) = resolve_path(&policy.root, filename) else {
        warn!(
            "request for {filename:?} from {} escapes the served directory",
            endpoint.peer(),
        );
        report(endpoint, ErrorCode::AccessViolation, "access violation").await;
        return None;
    };

    match endpoint.opcode() {
        Opcode::Rrq => {
            if let Some(buffer) = pool.check_out(&path) {
                return Some(buffer);
            }
            match std::fs::File::open(&path) {
                Ok(file) => match FileBuffer::reading(file, path) {
                    Ok(buffer) => Some(buffer),
                    Err(err) => {
                        warn!("failed to stat {filename:?}: {err}");
                        report(endpoint, ErrorCode::NotDefined, "could not stat file").await;
                        None
                    }
                },
                Err(err) => {
                    let (code, message) = map_open_error(&err);
                    warn!("failed to open {filename:?}: {err}");
                    report(endpoint, code, message).await;
                    None
                }
            }
        }
        _ => open_for_writing(endpoint, policy, path).await,
    }
}

async fn open_for_writing(
    endpoint: &TransferEndpoint,
    policy: &FilePolicy,
    path: PathBuf,
) -> Option<FileBuffer> {
    let exists = match std::fs::metadata(&path) {
        Ok(_) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            let (code, message) = map_open_error(&err);
            warn!("failed to stat {path:?}: {err}");
            report(endpoint, code, message).await;
            return None;
        }
    };

    if exists && policy.no_clobber {
        report(endpoint, ErrorCode::FileAlreadyExists, "file already exists").await;
        return None;
    }
    if !exists && !policy.create {
        report(endpoint, ErrorCode::FileNotFound, "File not found").await;
        return None;
    }

    let open = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(policy.create)
        .open(&path);
    match open {
        Ok(file) => Some(FileBuffer::writing(file, path)),
        Err(err) => {
            let (code, message) = map_open_error(&err);
            warn!("failed to open {path:?} for writing: {err}");
            report(endpoint, code, message).await;
            None
        }
    }
}

/// Joins `filename` to the served directory, refusing anything that could
/// land outside it: absolute paths and any `..` component.
fn resolve_path(root: &Path, filename: &str) -> Option<PathBuf> {
    let requested = Path::new(filename);
    if requested.is_absolute() {
        return None;
    }
    if !requested
        .components()
        .all(|c| matches!(c, Component::CurDir | Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(requested))
}

fn map_open_error(err: &std::io::Error) -> (ErrorCode, &'static str) {
    match err.kind() {
        std::io::ErrorKind::NotFound => (ErrorCode::FileNotFound, "File not found"),
        std::io::ErrorKind::PermissionDenied => (ErrorCode::AccessViolation, "permission denied"),
        _ => (ErrorCode::NotDefined, "could not open file"),
    }
}

/// Best-effort error reply on the initial request path.
async fn report(endpoint: &TransferEndpoint, code: ErrorCode, message: &str) {
    if let Err(err) = endpoint.send_error(code, message).await {
        warn!("failed to send error packet to {}: {err}", endpoint.peer());
    }
}
