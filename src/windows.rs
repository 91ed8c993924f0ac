//! Live session transport on Windows.
//!
//! The host publishes a discovery table in a well-known file mapping; each
//! record names a host process. Claiming a game means opening that process's
//! named pipe and snapshot mapping. Mapped views are unmapped and handles
//! closed on drop.

#![cfg(windows)]

use std::ffi::c_void;
use std::fs::File;
use std::io::{Read, Write};

use tracing::{debug, info};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Memory::{
    FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW,
    UnmapViewOfFile,
};

use crate::data::{GAME_INSTANCE_SIZE, GAME_TABLE_MAX_GAMES, SNAPSHOT_SIZE, read_game_table};
use crate::error::{ClientError, Result};
use crate::region::{CODE_FRAME_READY, SharedRegion};

const GAME_TABLE_MAPPING: &str = "Local\\bwapi_shared_memory_game_list";

fn snapshot_mapping_name(process_id: i32) -> String {
    format!("Local\\bwapi_shared_memory_{process_id}")
}

fn pipe_path(process_id: i32) -> String {
    format!("\\\\.\\pipe\\bwapi_pipe_{process_id}")
}

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(Some(0)).collect()
}

/// An open named file mapping with a mapped view over `len` bytes.
struct Mapping {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

// SAFETY: the view points at a process-lifetime mapping owned by this struct,
// and all slice access goes through &self/&mut self, so aliasing follows the
// usual borrow rules.
unsafe impl Send for Mapping {}

impl Mapping {
    fn open(name: &str, len: usize) -> Result<Self> {
        let wide_name = wide(name);
        let handle = unsafe {
            OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, windows::core::PCWSTR(wide_name.as_ptr()))
        }
        .map_err(|e| ClientError::platform(format!("OpenFileMappingW({name})"), e))?;

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            let error = windows_core::Error::from_win32();
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(ClientError::platform(format!("MapViewOfFile({name})"), error));
        }

        debug!(name, len, "mapped shared memory");
        Ok(Self { handle, view, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the view covers `len` readable bytes for as long as the
        // mapping is held.
        unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and FILE_MAP_ALL_ACCESS makes the view writable.
        unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

/// [`SharedRegion`] over a live host: the snapshot file mapping plus the
/// handshake pipe.
pub struct MappedRegion {
    snapshot: Mapping,
    pipe: File,
}

impl SharedRegion for MappedRegion {
    fn len(&self) -> usize {
        self.snapshot.len
    }

    fn read(&self, f: &mut dyn FnMut(&[u8])) {
        f(self.snapshot.as_slice());
    }

    fn write(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        f(self.snapshot.as_mut_slice());
    }

    fn send(&mut self, code: u8) -> Result<()> {
        self.pipe
            .write_all(&[code])
            .and_then(|()| self.pipe.flush())
            .map_err(|e| ClientError::channel("send", e))
    }

    fn recv(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.pipe.read_exact(&mut buf).map_err(|e| ClientError::channel("recv", e))?;
        Ok(buf[0])
    }
}

/// Scans the discovery table and claims the first open game.
///
/// A record is claimable when its process id is nonzero and no client is
/// connected. Candidates that fail to open are skipped; if none succeeds the
/// result is [`ClientError::NoOpenGame`].
pub(crate) fn open_session() -> Result<MappedRegion> {
    let table = Mapping::open(GAME_TABLE_MAPPING, GAME_INSTANCE_SIZE * GAME_TABLE_MAX_GAMES)
        .map_err(|e| {
            ClientError::connection_failed_with_source(
                "game discovery table is not published; is the host running?",
                e.into(),
            )
        })?;

    for record in read_game_table(table.as_slice()) {
        if record.server_process_id == 0 || record.is_connected {
            continue;
        }
        match claim_game(record.server_process_id) {
            Ok(region) => {
                info!(process_id = record.server_process_id, "claimed open game");
                return Ok(region);
            }
            Err(error) => {
                debug!(
                    process_id = record.server_process_id,
                    %error,
                    "skipping game candidate"
                );
            }
        }
    }
    Err(ClientError::NoOpenGame)
}

fn claim_game(process_id: i32) -> Result<MappedRegion> {
    let pipe = File::options()
        .read(true)
        .write(true)
        .open(pipe_path(process_id))
        .map_err(|e| ClientError::channel("open", e))?;

    let snapshot = Mapping::open(&snapshot_mapping_name(process_id), SNAPSHOT_SIZE)?;
    let mut region = MappedRegion { snapshot, pipe };

    // The host grants first access to the region by sending the frame-ready
    // code once its side of the handshake is up.
    loop {
        if region.recv()? == CODE_FRAME_READY {
            return Ok(region);
        }
    }
}
