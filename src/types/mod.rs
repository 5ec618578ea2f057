pub mod amount;
pub mod asset;
pub mod price;

pub use amount::Amount;
pub use asset::Asset;
pub use price::Price;
