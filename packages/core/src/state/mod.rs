// Состояние клиента поверх хранилища

pub mod conversations;

pub use conversations::{ConversationSummary, ConversationsManager};
