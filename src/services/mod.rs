//! Business logic for the three banking services. Each service owns its
//! table; references across services go through the seams in `clients`.

pub mod accounts;
pub mod cards;
pub mod customers;

pub use accounts::AccountService;
pub use cards::CardService;
pub use customers::CustomerService;
