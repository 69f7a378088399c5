pub mod create_user;
pub mod issue_token;
pub mod migrate;
pub mod serve;

pub use create_user::handle_create_user;
pub use issue_token::handle_issue_token;
pub use migrate::handle_migrate;
pub use serve::handle_serve;
