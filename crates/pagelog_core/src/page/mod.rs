//! Page formats: the common header, slotted item pages, overflow pages,
//! free pages and the metadata page.

mod item;
mod layout;

pub use item::{Item, ITEM_HEADER_SIZE};
pub use layout::{Page, PageType, META_MAGIC, META_VERSION, PAGE_HEADER_SIZE};
