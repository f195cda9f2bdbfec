use std::ops::Deref;

use log::warn;

use crate::{BrokerClient, BrokerError};

/// Connected scope over a [`BrokerClient`].
///
/// The client is disconnected when the session is dropped, on every exit path.
/// Use [`Session::close`] to observe a failing disconnect.
pub struct Session<'a, C: BrokerClient + ?Sized> {
    client: &'a C,
    open: bool,
}

/// Connect `client` and return a guard that disconnects it on drop.
pub fn session<C: BrokerClient + ?Sized>(client: &C) -> Result<Session<'_, C>, BrokerError> {
    client.connect()?;
    Ok(Session { client, open: true })
}

impl<C: BrokerClient + ?Sized> Session<'_, C> {
    pub fn close(mut self) -> Result<(), BrokerError> {
        self.open = false;
        self.client.disconnect()
    }
}

impl<C: BrokerClient + ?Sized> Deref for Session<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
    }
}

impl<C: BrokerClient + ?Sized> Drop for Session<'_, C> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.client.disconnect() {
                warn!("Failed to disconnect broker session: {}", err);
            }
        }
    }
}
