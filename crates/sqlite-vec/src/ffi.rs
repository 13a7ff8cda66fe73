//! C entry points
//!
//! Both functions follow SQLite's extension entry-point convention and can be
//! handed to `sqlite3_auto_extension` or called directly on an open handle.
//! The extension links the same SQLite as its host, so the API routines
//! pointer is accepted and ignored.

use std::ffi::{c_char, c_int, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};

use rusqlite::{ffi, Connection};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Register every function, table function and the `vec0` module on `db`
///
/// # Safety
/// `db` must be null or a valid open connection handle, and `pz_err_msg`
/// must be null or point to writable storage for one pointer. A message
/// written there is allocated with `sqlite3_mprintf` and must be released
/// with `sqlite3_free`.
#[no_mangle]
pub unsafe extern "C" fn sqlite3_vec_init(
    db: *mut ffi::sqlite3,
    pz_err_msg: *mut *mut c_char,
    _p_api: *const ffi::sqlite3_api_routines,
) -> c_int {
    init(db, pz_err_msg, "sqlite3_vec_init", crate::register)
}

/// Register `vec_npy_file`, which reads from the filesystem
///
/// # Safety
/// Same contract as [`sqlite3_vec_init`].
#[no_mangle]
pub unsafe extern "C" fn sqlite3_vec_fs_read_init(
    db: *mut ffi::sqlite3,
    pz_err_msg: *mut *mut c_char,
    _p_api: *const ffi::sqlite3_api_routines,
) -> c_int {
    init(db, pz_err_msg, "sqlite3_vec_fs_read_init", crate::register_fs_read)
}

/// Install [`sqlite3_vec_init`] for every connection opened afterwards in
/// this process
pub fn register_auto_extension() -> Result<()> {
    let rc = unsafe {
        ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )))
    };
    if rc != ffi::SQLITE_OK {
        return Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(rc),
            Some("sqlite3_auto_extension failed".to_string()),
        )));
    }
    debug!("registered sqlite-vec as an auto extension");
    Ok(())
}

unsafe fn init(
    db: *mut ffi::sqlite3,
    pz_err_msg: *mut *mut c_char,
    entry: &str,
    register: fn(&Connection) -> Result<()>,
) -> c_int {
    if db.is_null() {
        set_error(pz_err_msg, &format!("{entry}: database handle is NULL"));
        return ffi::SQLITE_MISUSE;
    }

    let result = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        // Borrowed handle: dropping the wrapper leaves the connection open
        let conn = unsafe { Connection::from_handle(db)? };
        register(&conn)
    }));

    match result {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => {
            warn!(entry, error = %err, "extension registration failed");
            set_error(pz_err_msg, &format!("{entry}: {err}"));
            error_code(&err)
        }
        Err(_) => {
            warn!(entry, "extension registration panicked");
            set_error(pz_err_msg, &format!("{entry}: internal error"));
            ffi::SQLITE_INTERNAL
        }
    }
}

fn error_code(err: &Error) -> c_int {
    match err {
        Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => e.extended_code,
        _ => ffi::SQLITE_ERROR,
    }
}

/// Store a `sqlite3_mprintf` copy of `msg` in `*pz_err_msg`
unsafe fn set_error(pz_err_msg: *mut *mut c_char, msg: &str) {
    if pz_err_msg.is_null() {
        return;
    }
    let Ok(msg) = CString::new(msg.replace('\0', "")) else {
        return;
    };
    *pz_err_msg = ffi::sqlite3_mprintf(b"%s\0".as_ptr() as *const c_char, msg.as_ptr());
}
