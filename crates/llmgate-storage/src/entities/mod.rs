pub mod keys;
pub mod proxies;

pub use keys::Entity as Keys;
pub use proxies::Entity as Proxies;
