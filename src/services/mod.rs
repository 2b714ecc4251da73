//! Business logic: room operations, presence, broadcast, sessions and checkout.

pub mod channel;
pub mod checkout;
pub mod presence;
pub mod room;
pub mod session;
pub mod store;

pub use channel::ChannelService;
pub use checkout::PricingPolicy;
pub use presence::PresenceService;
pub use room::RoomService;
pub use session::RoomSession;
pub use store::{MemoryRoomStore, RoomStore};
