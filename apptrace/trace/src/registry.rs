//! Name to vtable lookup for encoders and transports.

use apptrace_core::{TraceError, TraceResult};
use heapless::Vec;

use crate::encoder::Encoder;
use crate::transport::Transport;

/// Maximum number of registered encoders
pub const MAX_ENCODERS: usize = 4;

/// Maximum number of registered transports
pub const MAX_TRANSPORTS: usize = 4;

/// Bounded table of the encoders and transports available at boot
pub struct Registry<'a> {
    encoders: Vec<&'a dyn Encoder<'a>, MAX_ENCODERS>,
    transports: Vec<&'a dyn Transport, MAX_TRANSPORTS>,
}

impl<'a> Registry<'a> {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            encoders: Vec::new(),
            transports: Vec::new(),
        }
    }

    /// Register an encoder under its own name
    pub fn register_encoder(&mut self, encoder: &'a dyn Encoder<'a>) -> TraceResult<()> {
        if self.find_encoder(encoder.name()).is_some() {
            return Err(TraceError::InvalidState);
        }
        self.encoders
            .push(encoder)
            .map_err(|_| TraceError::OutOfMemory)
    }

    /// Register a transport under its own name
    pub fn register_transport(&mut self, transport: &'a dyn Transport) -> TraceResult<()> {
        if self.find_transport(transport.name()).is_some() {
            return Err(TraceError::InvalidState);
        }
        self.transports
            .push(transport)
            .map_err(|_| TraceError::OutOfMemory)
    }

    /// Builder form of [`Registry::register_encoder`]
    pub fn with_encoder(mut self, encoder: &'a dyn Encoder<'a>) -> TraceResult<Self> {
        self.register_encoder(encoder)?;
        Ok(self)
    }

    /// Builder form of [`Registry::register_transport`]
    pub fn with_transport(mut self, transport: &'a dyn Transport) -> TraceResult<Self> {
        self.register_transport(transport)?;
        Ok(self)
    }

    pub fn find_encoder(&self, name: &str) -> Option<&'a dyn Encoder<'a>> {
        self.encoders.iter().copied().find(|e| e.name() == name)
    }

    pub fn find_transport(&self, name: &str) -> Option<&'a dyn Transport> {
        self.transports.iter().copied().find(|t| t.name() == name)
    }

    /// Names of all registered encoders
    pub fn encoder_names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.encoders.iter().copied().map(|e| e.name())
    }

    /// Names of all registered transports
    pub fn transport_names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.transports.iter().copied().map(|t| t.name())
    }
}

impl Default for Registry<'_> {
    fn default() -> Self {
        Self::new()
    }
}
