pub mod add;
pub mod cancel;
pub mod delete;
pub mod list;
pub mod scan;
pub mod work;
