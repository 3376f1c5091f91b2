use tracing::{debug, trace};
use uuid::Uuid;

use crate::registry::{ConnectionHandle, ConnectionRegistry, Payload};

/// Where an envelope should go on this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Every open local connection
    Everyone,
    /// The one connection registered for this user, if any
    User(&'a str),
}

impl<'a> Target<'a> {
    pub fn from_recipient(recipient: Option<&'a str>) -> Self {
        match recipient {
            Some(user) => Self::User(user),
            None => Self::Everyone,
        }
    }
}

/// One connection selected for delivery.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user: String,
    pub handle: ConnectionHandle,
}

/// Writes envelopes to the local connections they are meant for. Used for
/// self-delivery after a publish and by the broker consumer loops.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Connections an envelope for `target` goes to, from the current
    /// registry snapshot.
    pub fn recipients(&self, target: Target<'_>) -> Vec<Recipient> {
        match target {
            Target::Everyone => {
                let mut all = Vec::with_capacity(self.registry.len());
                self.registry.for_each_open(|user, handle| {
                    all.push(Recipient {
                        user: user.to_string(),
                        handle: handle.clone(),
                    })
                });
                all
            }
            Target::User(user) => self
                .registry
                .lookup(user)
                .map(|handle| Recipient {
                    user: user.to_string(),
                    handle,
                })
                .into_iter()
                .collect(),
        }
    }

    /// Queue `payload` on every matching connection. Returns how many took
    /// it. A connection whose queue is closed is treated as gone and pruned.
    pub fn deliver(&self, payload: &Payload, target: Target<'_>) -> usize {
        let delivered = self.write(payload, self.recipients(target));
        trace!(?target, delivered, "Delivered envelope locally");
        delivered
    }

    fn write(&self, payload: &Payload, recipients: Vec<Recipient>) -> usize {
        let mut delivered = 0;
        let mut gone: Vec<(String, Uuid)> = Vec::new();

        for recipient in recipients {
            if recipient.handle.send(payload.clone()) {
                delivered += 1;
            } else {
                gone.push((recipient.user, recipient.handle.conn_id()));
            }
        }

        for (user, conn_id) in gone {
            if self.registry.unregister(&user, conn_id) {
                debug!("Pruned closed connection for {}", user);
            }
        }

        delivered
    }
}
