//! Live change notifications for Hoard.
//!
//! Mutating vault operations publish a [`ChangeEvent`] after they commit;
//! the [`ChangeNotifier`] hub fans it out to every subscriber's bounded
//! outbox. Delivery is best effort: a subscriber that cannot keep up is
//! dropped.

mod event;
mod hub;

pub use event::{ChangeEvent, EventType};
pub use hub::{ChangeNotifier, SubscriberId, Subscription};
