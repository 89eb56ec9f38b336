//! Reading one command's response.

use std::sync::Arc;

use bytes::Bytes;
use tds_wire::{ColMetaData, ColumnData, Row, ServerMessage, SqlValue, Token, TokenStream};

use crate::command::{ExecutionFlags, SharedFlags};
use crate::error::Error;
use crate::session::SessionShared;

/// Row-by-row view over a command's response.
///
/// The response is already off the wire when a reader is handed out, so
/// other slots on the same connection can proceed while this one is being
/// consumed. Environment changes in the response are applied to the
/// session as they are decoded; tokens left unread on drop are still
/// scanned for them.
///
/// Statements that return no columns are skipped by
/// [`next_row`](Self::next_row) except for their row counts. Use
/// [`next_result`](Self::next_result) to move past a result set.
#[derive(Debug)]
pub struct ResultSetReader {
    stream: TokenStream,
    session: Arc<SessionShared>,
    flags: Arc<SharedFlags>,
    columns: Option<Arc<ColMetaData>>,
    row: Option<Row>,
    rows_affected: Option<u64>,
    return_status: Option<i32>,
    messages: Vec<ServerMessage>,
    pending_error: Option<Error>,
    result_done: bool,
}

impl ResultSetReader {
    pub(crate) fn new(payload: Bytes, session: Arc<SessionShared>, flags: Arc<SharedFlags>) -> Self {
        let stream = TokenStream::with_policy(payload, session.config().unknown_token_policy);
        Self {
            stream,
            session,
            flags,
            columns: None,
            row: None,
            rows_affected: None,
            return_status: None,
            messages: Vec::new(),
            pending_error: None,
            result_done: false,
        }
    }

    /// Columns of the current result set; empty before metadata arrives.
    #[must_use]
    pub fn columns(&self) -> &[ColumnData] {
        self.columns
            .as_deref()
            .map(|meta| meta.columns.as_slice())
            .unwrap_or_default()
    }

    /// Index of a column by name, ignoring ASCII case.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.as_deref().and_then(|meta| meta.find(name))
    }

    /// Advance to the next row of the current result set.
    ///
    /// Returns `false` at the end of the set. A server error raised inside
    /// the set is returned once the set's DONE token has been reached.
    pub fn next_row(&mut self) -> Result<bool, Error> {
        self.row = None;
        if self.result_done {
            return Ok(false);
        }

        loop {
            let Some(token) = self.next_token()? else {
                self.result_done = true;
                return self.end_of_set();
            };
            match token {
                Token::ColMetaData(meta) => self.columns = Some(meta),
                Token::Row(row) => {
                    self.flags.set_has_rows();
                    self.row = Some(row);
                    return Ok(true);
                }
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                    if done.has_count() {
                        self.rows_affected = Some(done.row_count);
                    }
                    if done.has_error() {
                        self.flags.set_had_error();
                    }
                    // statements without a result set do not end one
                    if self.columns.is_none() && done.has_more() && self.pending_error.is_none()
                    {
                        continue;
                    }
                    self.result_done = true;
                    return self.end_of_set();
                }
                Token::Error(msg) => {
                    self.flags.set_had_error();
                    tracing::debug!(
                        session = self.session.id(),
                        number = msg.number,
                        class = msg.class,
                        message = %msg.message,
                        "server error in response"
                    );
                    self.pending_error
                        .get_or_insert_with(|| Error::from_server_message(&msg));
                }
                Token::Info(msg) => self.messages.push(msg),
                Token::EnvChange(change) => {
                    let applied = self.session.apply_env_change(&change);
                    self.check(applied)?;
                }
                Token::ReturnStatus(status) => self.return_status = Some(status),
                Token::LoginAck(_) => {
                    return self.check(Err(Error::UnexpectedToken("LOGINACK")));
                }
                other => {
                    tracing::trace!(token = ?other, "skipping token");
                }
            }
        }
    }

    /// Move to the next result set of a multi-statement batch.
    ///
    /// Drains what is left of the current set first. Returns `false` once
    /// the response is exhausted.
    pub fn next_result(&mut self) -> Result<bool, Error> {
        while self.next_row()? {}
        if self.stream.is_finished() {
            return Ok(false);
        }
        self.result_done = false;
        self.columns = None;
        self.rows_affected = None;
        Ok(true)
    }

    /// Consume the rest of the response.
    ///
    /// Fails if a server error was reported anywhere in it, or if the
    /// response does not end in exactly one terminal DONE.
    pub fn finish(mut self) -> Result<(), Error> {
        let mut first_error = None;
        loop {
            match self.next_result() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err @ Error::Server { .. }) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Value at `index` in the current row.
    pub fn get_value(&self, index: usize) -> Result<&SqlValue, Error> {
        let row = self.row.as_ref().ok_or(Error::NoCurrentRow)?;
        row.values.get(index).ok_or(Error::ColumnOutOfRange {
            index,
            count: row.values.len(),
        })
    }

    /// Whether the value at `index` is NULL.
    pub fn is_null(&self, index: usize) -> Result<bool, Error> {
        Ok(self.get_value(index)?.is_null())
    }

    /// Read an integer column that fits in `i32`.
    pub fn get_i32(&self, index: usize) -> Result<i32, Error> {
        self.typed(index, "int", SqlValue::as_i32)
    }

    /// Read any integer column.
    pub fn get_i64(&self, index: usize) -> Result<i64, Error> {
        self.typed(index, "bigint", SqlValue::as_i64)
    }

    /// Read a floating-point column.
    pub fn get_f64(&self, index: usize) -> Result<f64, Error> {
        self.typed(index, "float", SqlValue::as_f64)
    }

    /// Read a `bit` column.
    pub fn get_bool(&self, index: usize) -> Result<bool, Error> {
        self.typed(index, "bit", SqlValue::as_bool)
    }

    /// Read a character column.
    pub fn get_string(&self, index: usize) -> Result<&str, Error> {
        self.typed(index, "string", SqlValue::as_str)
    }

    /// Read a binary column.
    pub fn get_bytes(&self, index: usize) -> Result<&[u8], Error> {
        self.typed(index, "binary", SqlValue::as_bytes)
    }

    /// Row count of the last completed statement.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Return status of a procedure call, if one was reported.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// INFO messages seen so far.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Execution flags so far.
    #[must_use]
    pub fn flags(&self) -> ExecutionFlags {
        self.flags.snapshot()
    }

    /// Whether the terminal DONE has been consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stream.is_finished()
    }

    fn typed<'a, T>(
        &'a self,
        index: usize,
        expected: &'static str,
        convert: impl FnOnce(&'a SqlValue) -> Option<T>,
    ) -> Result<T, Error> {
        let value = self.get_value(index)?;
        convert(value).ok_or(Error::TypeMismatch {
            index,
            expected,
            actual: value.kind(),
        })
    }

    fn end_of_set(&mut self) -> Result<bool, Error> {
        match self.pending_error.take() {
            Some(err) => self.check(Err(err)),
            None => Ok(false),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, Error> {
        let decoded = self.stream.next_token().map_err(Error::from);
        self.check(decoded)
    }

    /// Fault the session on errors the connection cannot recover from.
    fn check<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if err.is_fatal_to_connection() {
                self.session.fault(err);
            }
        }
        result
    }
}

impl Drop for ResultSetReader {
    fn drop(&mut self) {
        while !self.stream.is_finished() {
            match self.next_token() {
                Ok(Some(Token::EnvChange(change))) => {
                    let applied = self.session.apply_env_change(&change);
                    if self.check(applied).is_err() {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
}
