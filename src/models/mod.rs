pub mod booking;
pub mod money;
pub mod offering;
pub mod payment;

pub use booking::{Booking, BookingItem, BookingStatus, CollectionType, ServiceAddress};
pub use offering::Offering;
pub use payment::{Payment, PaymentStatus};
