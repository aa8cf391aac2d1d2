// Время

use chrono::Utc;

/// Unix timestamp в секундах
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Unix timestamp в миллисекундах (порядок сообщений, расписание очереди)
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
