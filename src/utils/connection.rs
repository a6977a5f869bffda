//! PostgreSQL connection handling utilities
//!
//! Provides a safe wrapper around PostgreSQL's C library (libpq)
//! for both regular SQL sessions and logical replication sessions.
//! Handles connection lifecycle, query execution, prepared statements,
//! and the COPY BOTH streaming used by the replication protocol.

use crate::errors::{CdcError, CdcResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::time::Duration;

/// Which side of the migration a connection talks to.
///
/// Errors raised through a connection carry its side, so worker exit codes
/// fall into the right category without every call site re-tagging them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Source,
    Target,
}

/// One unit of data read from a COPY BOTH stream in non-blocking mode
#[derive(Debug)]
pub enum CopyData {
    /// A complete CopyData row
    Row(Vec<u8>),
    /// No complete row available yet; poll the socket and consume input
    WouldBlock,
    /// The COPY has ended
    Done,
}

/// Safe wrapper for PostgreSQL connection using libpq
///
/// Provides a safe Rust interface to PostgreSQL's C library (libpq).
/// Handles connection lifecycle, query execution, prepared statements,
/// and replication protocol operations.
pub struct PgConnection {
    conn: *mut PGconn,
    kind: ConnKind,
}

// The raw PGconn is only ever used from the worker thread that owns the
// wrapper; libpq connections are not shared between threads.
unsafe impl Send for PgConnection {}

impl PgConnection {
    /// Establishes a connection to PostgreSQL using the provided connection info.
    ///
    /// # Arguments
    /// * `conninfo` - A connection string or URI
    /// * `kind` - Which side of the migration this connection talks to
    pub fn connect(conninfo: &str, kind: ConnKind) -> CdcResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(kind_error(kind, "Failed to allocate connection object".into()));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or("Unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(kind_error(kind, format!("Connection failed: {}", error_msg)));
        }

        Ok(Self { conn, kind })
    }

    /// Establishes a logical replication session against the source.
    ///
    /// libpq enters walsender mode when the conninfo carries
    /// `replication=database`; the session then accepts replication commands
    /// (IDENTIFY_SYSTEM, TIMELINE_HISTORY, START_REPLICATION) plus SHOW.
    pub fn connect_replication(conninfo: &str) -> CdcResult<Self> {
        let conninfo = if conninfo.contains("://") {
            // URI form: append as a query parameter
            if conninfo.contains('?') {
                format!("{}&replication=database", conninfo)
            } else {
                format!("{}?replication=database", conninfo)
            }
        } else {
            format!("{} replication=database", conninfo)
        };
        Self::connect(&conninfo, ConnKind::Source)
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Build an error of this connection's kind with libpq's current message attached
    pub fn error(&self, message: &str) -> CdcError {
        let detail = get_error_message(self.conn).unwrap_or("Unknown error".to_string());
        kind_error(self.kind, format!("{}: {}", message, detail.trim_end()))
    }

    /// Executes a query on the PostgreSQL connection.
    pub fn exec(&self, query: &str) -> CdcResult<PgResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(self.error("Query execution failed"));
        }

        Ok(PgResult { result })
    }

    /// Executes a query and fails unless the server reports success.
    pub fn exec_ok(&self, query: &str) -> CdcResult<PgResult> {
        let result = self.exec(query)?;
        if !result.is_ok() {
            return Err(self.error(&format!("Query failed: {}", query)));
        }
        Ok(result)
    }

    /// Executes a parameterized query, all parameters in text form.
    ///
    /// A `None` parameter is sent as SQL NULL.
    pub fn exec_params(&self, query: &str, params: &[Option<&str>]) -> CdcResult<PgResult> {
        let c_query = CString::new(query)?;
        let c_params: Vec<Option<CString>> = params
            .iter()
            .map(|p| p.map(CString::new).transpose())
            .collect::<Result<_, _>>()?;
        let param_ptrs: Vec<*const c_char> = c_params
            .iter()
            .map(|p| p.as_ref().map_or(ptr::null(), |c| c.as_ptr()))
            .collect();

        let result = unsafe {
            PQexecParams(
                self.conn,
                c_query.as_ptr(),
                params.len() as i32,
                ptr::null(), // infer parameter types
                param_ptrs.as_ptr(),
                ptr::null(), // text parameters need no lengths
                ptr::null(), // all text format
                0,           // text results
            )
        };

        if result.is_null() {
            return Err(self.error("Parameterized query execution failed"));
        }

        Ok(PgResult { result })
    }

    /// Like `exec_params` but fails unless the server reports success.
    pub fn exec_params_ok(&self, query: &str, params: &[Option<&str>]) -> CdcResult<PgResult> {
        let result = self.exec_params(query, params)?;
        if !result.is_ok() {
            return Err(self.error(&format!("Query failed: {}", query)));
        }
        Ok(result)
    }

    /// Creates a server-side prepared statement.
    pub fn prepare(&self, name: &str, query: &str) -> CdcResult<()> {
        let c_name = CString::new(name)?;
        let c_query = CString::new(query)?;
        let result = unsafe {
            PQprepare(self.conn, c_name.as_ptr(), c_query.as_ptr(), 0, ptr::null())
        };

        if result.is_null() {
            return Err(self.error("PREPARE failed"));
        }
        let result = PgResult { result };
        if !result.is_ok() {
            return Err(self.error(&format!("PREPARE {} failed", name)));
        }
        Ok(())
    }

    /// Executes a previously prepared statement with text parameters.
    pub fn exec_prepared(&self, name: &str, params: &[Option<&str>]) -> CdcResult<PgResult> {
        let c_name = CString::new(name)?;
        let c_params: Vec<Option<CString>> = params
            .iter()
            .map(|p| p.map(CString::new).transpose())
            .collect::<Result<_, _>>()?;
        let param_ptrs: Vec<*const c_char> = c_params
            .iter()
            .map(|p| p.as_ref().map_or(ptr::null(), |c| c.as_ptr()))
            .collect();

        let result = unsafe {
            PQexecPrepared(
                self.conn,
                c_name.as_ptr(),
                params.len() as i32,
                param_ptrs.as_ptr(),
                ptr::null(),
                ptr::null(),
                0,
            )
        };

        if result.is_null() {
            return Err(self.error("EXECUTE failed"));
        }

        Ok(PgResult { result })
    }

    /// Gets data from a COPY operation (blocking).
    ///
    /// Returns `Some(row)` for each CopyData row, `None` once the COPY has
    /// ended cleanly.
    pub fn get_copy_data(&self) -> CdcResult<Option<Vec<u8>>> {
        let mut buffer: *mut c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };
        self.interpret_copy_data(copy_data_len, buffer)
            .map(|data| match data {
                CopyData::Row(row) => Some(row),
                _ => None,
            })
    }

    /// Gets data from a COPY operation without blocking.
    ///
    /// `WouldBlock` means the caller should wait for the socket to become
    /// readable, call `consume_input`, and try again.
    pub fn get_copy_data_async(&self) -> CdcResult<CopyData> {
        let mut buffer: *mut c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };
        self.interpret_copy_data(copy_data_len, buffer)
    }

    fn interpret_copy_data(&self, len: i32, buffer: *mut c_char) -> CdcResult<CopyData> {
        match len {
            -2 => Err(self.error("COPY data read failed")),
            -1 => {
                // COPY is done; fetch the final command status
                let result = PgResult {
                    result: unsafe { PQgetResult(self.conn) },
                };
                if !result.result.is_null() && !result.is_ok() {
                    return Err(self.error("COPY ended with an error"));
                }
                Ok(CopyData::Done)
            }
            0 => Ok(CopyData::WouldBlock),
            len => {
                if buffer.is_null() {
                    return Err(self.error("Received null COPY buffer"));
                }
                let data =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(CopyData::Row(data))
            }
        }
    }

    /// Reads newly arrived data from the socket into libpq's buffer.
    pub fn consume_input(&self) -> CdcResult<()> {
        let rc = unsafe { PQconsumeInput(self.conn) };
        if rc == 0 {
            return Err(self.error("Failed to consume replication input"));
        }
        Ok(())
    }

    /// Waits for the connection socket to become readable.
    ///
    /// Returns `true` when data is ready, `false` on timeout (or a signal
    /// interrupting the wait, which callers treat the same way).
    pub fn await_readable(&self, timeout: Duration) -> CdcResult<bool> {
        let fd = unsafe { PQsocket(self.conn) };
        if fd < 0 {
            return Err(self.error("Connection has no socket"));
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        match rc {
            -1 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(CdcError::Io(err))
                }
            }
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    /// Sends data to a COPY operation.
    pub fn put_copy_data(&self, data: &[u8]) -> CdcResult<()> {
        let result = unsafe {
            PQputCopyData(self.conn, data.as_ptr() as *const c_char, data.len() as i32)
        };

        if result != 1 {
            return Err(self.error("Failed to send copy data"));
        }

        Ok(())
    }

    /// Flushes the connection buffer.
    pub fn flush(&self) -> CdcResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(self.error("Failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn kind_error(kind: ConnKind, message: String) -> CdcError {
    match kind {
        ConnKind::Source => CdcError::source(message),
        ConnKind::Target => CdcError::target(message),
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned())
        }
    }
}

/// Safe wrapper for PostgreSQL result.
///
/// This struct provides a safe interface to PostgreSQL query results using libpq.
/// It handles access to result metadata and data values.
pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    /// Gets the status of the PostgreSQL result.
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// Checks if the PostgreSQL result is successful.
    ///
    /// Returns true for PGRES_TUPLES_OK and PGRES_COMMAND_OK status codes.
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    /// Gets the number of tuples (rows) in the result.
    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    /// Gets the number of fields (columns) in the result.
    #[allow(unused)]
    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    /// Number of rows affected by the command, when the server reports one.
    pub fn cmd_tuples(&self) -> i64 {
        let ptr = unsafe { PQcmdTuples(self.result) };
        if ptr.is_null() {
            return 0;
        }
        let text = unsafe { CStr::from_ptr(ptr).to_string_lossy() };
        text.trim().parse().unwrap_or(0)
    }

    /// True when the value at (row, col) is SQL NULL.
    pub fn is_null(&self, row: i32, col: i32) -> bool {
        unsafe { PQgetisnull(self.result, row, col) != 0 }
    }

    /// Gets a value from the result by row and column index.
    ///
    /// Returns None for SQL NULL or out-of-range positions.
    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        if self.is_null(row, col) {
            return None;
        }
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
