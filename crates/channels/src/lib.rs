//! Outbound side of the drip engine.
//!
//! Composer: renders a flow message against a subscriber's metadata and
//! coupon. Delivery: the adapter boundary plus a Twilio-shaped SMS provider.

pub mod composer;
pub mod delivery;
pub mod sms;

pub use composer::MessageComposer;
pub use delivery::{DeliveryAdapter, DeliveryReceipt, DeliveryRequest};
pub use sms::SmsProvider;
