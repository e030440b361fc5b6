//! Cport drivers and their operation handler tables.
//!
//! A driver is a named set of per-type handlers plus optional init/exit
//! hooks. The handler table is sorted by type when the driver is registered
//! and is read-only afterwards, so dispatch looks handlers up by binary
//! search without taking a lock.

use core::fmt;

use super::CportId;
use super::engine::Greybus;
use super::header::{INVALID_TYPE, OpResult};
use super::operation::Operation;
use crate::error::{Error, Result};

/// Handler run on the cport worker; the returned result is sent back
/// automatically when the request carried a non-zero id.
pub type RequestHandler = Box<dyn Fn(&Greybus, &Operation) -> OpResult + Send + Sync>;

/// Handler run inline on the receive path with the raw frame, without
/// allocating an Operation. May be called from interrupt context.
pub type FastHandler = Box<dyn Fn(CportId, &[u8]) + Send + Sync>;

pub type InitHook = Box<dyn Fn(CportId) -> Result<()> + Send + Sync>;
pub type ExitHook = Box<dyn Fn(CportId) + Send + Sync>;

/// One entry of a driver's handler table.
pub struct OperationHandler {
    op_type: u8,
    handler: Option<RequestHandler>,
    fast_handler: Option<FastHandler>,
}

impl OperationHandler {
    pub fn new(op_type: u8) -> Self {
        Self {
            op_type,
            handler: None,
            fast_handler: None,
        }
    }

    pub fn handler(
        mut self,
        f: impl Fn(&Greybus, &Operation) -> OpResult + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(f));
        self
    }

    pub fn fast(mut self, f: impl Fn(CportId, &[u8]) + Send + Sync + 'static) -> Self {
        self.fast_handler = Some(Box::new(f));
        self
    }

    pub fn op_type(&self) -> u8 {
        self.op_type
    }

    pub(crate) fn request_handler(&self) -> Option<&RequestHandler> {
        self.handler.as_ref()
    }

    pub(crate) fn fast_handler(&self) -> Option<&FastHandler> {
        self.fast_handler.as_ref()
    }
}

/// A protocol driver bound to exactly one cport.
pub struct CportDriver {
    name: &'static str,
    handlers: Vec<OperationHandler>,
    init: Option<InitHook>,
    exit: Option<ExitHook>,
    stack_size: Option<usize>,
}

impl CportDriver {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Vec::new(),
            init: None,
            exit: None,
            stack_size: None,
        }
    }

    fn entry_mut(&mut self, op_type: u8) -> &mut OperationHandler {
        let idx = match self.handlers.iter().position(|h| h.op_type == op_type) {
            Some(idx) => idx,
            None => {
                self.handlers.push(OperationHandler::new(op_type));
                self.handlers.len() - 1
            }
        };
        &mut self.handlers[idx]
    }

    /// Register the worker-side handler for `op_type`.
    pub fn handler(
        mut self,
        op_type: u8,
        f: impl Fn(&Greybus, &Operation) -> OpResult + Send + Sync + 'static,
    ) -> Self {
        self.entry_mut(op_type).handler = Some(Box::new(f));
        self
    }

    /// Register the inline fast handler for `op_type`. When present it takes
    /// precedence over the worker-side handler.
    pub fn fast_handler(
        mut self,
        op_type: u8,
        f: impl Fn(CportId, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.entry_mut(op_type).fast_handler = Some(Box::new(f));
        self
    }

    /// Append a prebuilt table entry as-is. Duplicates are rejected at
    /// registration.
    pub fn with_handler(mut self, entry: OperationHandler) -> Self {
        self.handlers.push(entry);
        self
    }

    pub fn on_init(mut self, f: impl Fn(CportId) -> Result<()> + Send + Sync + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    pub fn on_exit(mut self, f: impl Fn(CportId) + Send + Sync + 'static) -> Self {
        self.exit = Some(Box::new(f));
        self
    }

    /// Worker stack size hint in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn requested_stack_size(&self) -> Option<usize> {
        self.stack_size.filter(|&s| s > 0)
    }

    /// Validate the table and sort it by type.
    pub(crate) fn prepare(&mut self) -> Result<()> {
        let malformed = self.handlers.iter().any(|h| {
            h.op_type == INVALID_TYPE || (h.handler.is_none() && h.fast_handler.is_none())
        });
        if malformed {
            return Err(Error::InvalidArgument);
        }

        self.handlers.sort_unstable_by_key(|h| h.op_type);
        if self.handlers.windows(2).any(|w| w[0].op_type == w[1].op_type) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Binary search of the sorted table. Type 0 never matches.
    pub fn find_handler(&self, op_type: u8) -> Option<&OperationHandler> {
        if op_type == INVALID_TYPE {
            return None;
        }
        self.handlers
            .binary_search_by_key(&op_type, |h| h.op_type)
            .ok()
            .map(|idx| &self.handlers[idx])
    }

    pub(crate) fn run_init(&self, cport: CportId) -> Result<()> {
        self.init.as_ref().map_or(Ok(()), |f| f(cport))
    }

    pub(crate) fn run_exit(&self, cport: CportId) {
        if let Some(f) = &self.exit {
            f(cport);
        }
    }
}

impl fmt::Debug for CportDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<u8> = self.handlers.iter().map(|h| h.op_type).collect();
        f.debug_struct("CportDriver")
            .field("name", &self.name)
            .field("types", &types)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}
