//! Централизованная конфигурация для Parley Core
//!
//! Криптографические константы читаются через [`Config::global`], параметры
//! синхронизации передаются в `SyncReconciler` явно (см. `Config::from_env`).

use std::sync::OnceLock;

/// Глобальная конфигурация приложения (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// What happens to an unsent `send_message` operation when a delete for the
/// same message is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedePolicy {
    /// The pending send is dropped and the delete never reaches the wire.
    DeleteCancelsPendingSend,
    /// Both operations are kept and published in order.
    KeepAll,
}

/// Основная структура конфигурации
#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// PBKDF2: количество итераций для деривации мастер-ключа из пароля
    pub pbkdf2_iterations: u32,

    /// Длина соли для PBKDF2 (в байтах)
    pub salt_length: usize,

    /// Длина nonce для AES-GCM (в байтах)
    pub nonce_length: usize,

    /// Размер authentication tag (в байтах)
    pub aead_tag_length: usize,

    /// Размер публичного ключа X25519 (в байтах)
    pub public_key_size: usize,

    /// Размер Ed25519 подписи (в байтах)
    pub signature_size: usize,

    /// ID классического криптографического набора (Classic Suite)
    pub classic_suite_id: u16,

    // ============================================
    // КЛЮЧИ УСТРОЙСТВА
    // ============================================

    /// Размер пачки one-time pre-keys при генерации identity
    pub one_time_prekey_batch: u32,

    /// Проверять подпись signed pre-key у ключей собеседника
    pub verify_signed_prekeys: bool,

    /// Версия шифрования для исходящих envelope (1 = static ECDH, 2 = X3DH + Double Ratchet)
    pub encryption_version: u32,

    // ============================================
    // DOUBLE RATCHET ПАРАМЕТРЫ
    // ============================================

    /// Максимальное количество пропущенных сообщений (DoS защита)
    pub max_skipped_messages: u32,

    /// Максимальный возраст пропущенных ключей сообщений (в секундах)
    /// По умолчанию: 7 дней
    pub max_skipped_message_age_seconds: i64,

    // ============================================
    // ОЧЕРЕДЬ И СИНХРОНИЗАЦИЯ
    // ============================================

    /// Количество попыток отправки, после которого операция помечается failed
    pub max_send_attempts: u32,

    /// Максимальный размер очереди операций (старые вытесняются)
    pub queue_capacity: usize,

    /// Начальная задержка повторной отправки (в миллисекундах)
    pub retry_initial_ms: u64,

    /// Максимальная задержка повторной отправки (в миллисекундах)
    pub retry_max_ms: u64,

    /// Период фонового цикла повторной отправки (в миллисекундах)
    pub retry_tick_ms: u64,

    /// Таймаут одного publish-вызова транспорта (в миллисекундах)
    pub publish_timeout_ms: u64,

    /// Отправлять delivered-квитанции при получении сообщения
    pub send_delivery_receipts: bool,

    /// Политика для delete поверх неотправленного send
    pub supersede_policy: SupersedePolicy,

    // ============================================
    // СЕТЕВЫЕ ПАРАМЕТРЫ
    // ============================================

    /// Количество попыток запроса к key directory
    pub directory_fetch_attempts: u32,

    /// Начальная задержка для exponential backoff при переподключении (в миллисекундах)
    pub reconnect_initial_ms: u64,

    /// Максимальная задержка для exponential backoff (в миллисекундах)
    pub reconnect_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Криптография
            pbkdf2_iterations: 100_000,
            salt_length: 32,
            nonce_length: 12,
            aead_tag_length: 16,
            public_key_size: 32,
            signature_size: 64,
            classic_suite_id: 1,

            // Ключи устройства
            one_time_prekey_batch: 100,
            verify_signed_prekeys: true,
            encryption_version: 2,

            // Double Ratchet
            max_skipped_messages: 1000,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60, // 7 days

            // Очередь
            max_send_attempts: 5,
            queue_capacity: 500,
            retry_initial_ms: 1000,
            retry_max_ms: 60_000,
            retry_tick_ms: 2000,
            publish_timeout_ms: 10_000,
            send_delivery_receipts: true,
            supersede_policy: SupersedePolicy::DeleteCancelsPendingSend,

            // Сеть
            directory_fetch_attempts: 3,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Создать конфигурацию из переменных окружения (`PARLEY_*`)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_override("PARLEY_PBKDF2_ITERATIONS", &mut config.pbkdf2_iterations);
        env_override("PARLEY_MAX_SKIPPED_MESSAGES", &mut config.max_skipped_messages);
        env_override(
            "PARLEY_MAX_SKIPPED_MESSAGE_AGE_SECONDS",
            &mut config.max_skipped_message_age_seconds,
        );
        env_override("PARLEY_ONE_TIME_PREKEY_BATCH", &mut config.one_time_prekey_batch);
        env_override("PARLEY_VERIFY_SIGNED_PREKEYS", &mut config.verify_signed_prekeys);
        env_override("PARLEY_ENCRYPTION_VERSION", &mut config.encryption_version);
        env_override("PARLEY_MAX_SEND_ATTEMPTS", &mut config.max_send_attempts);
        env_override("PARLEY_QUEUE_CAPACITY", &mut config.queue_capacity);
        env_override("PARLEY_RETRY_INITIAL_MS", &mut config.retry_initial_ms);
        env_override("PARLEY_RETRY_MAX_MS", &mut config.retry_max_ms);
        env_override("PARLEY_PUBLISH_TIMEOUT_MS", &mut config.publish_timeout_ms);
        env_override("PARLEY_RECONNECT_MAX_MS", &mut config.reconnect_max_ms);

        if let Ok(val) = std::env::var("PARLEY_SUPERSEDE_POLICY") {
            match val.as_str() {
                "keep_all" => config.supersede_policy = SupersedePolicy::KeepAll,
                "delete_cancels_send" => {
                    config.supersede_policy = SupersedePolicy::DeleteCancelsPendingSend
                }
                _ => {}
            }
        }

        config
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(config).map_err(|_| "Config already initialized")
    }

    /// Проверить, инициализирована ли глобальная конфигурация
    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pbkdf2_iterations, 100_000);
        assert_eq!(config.max_skipped_messages, 1000);
        assert_eq!(config.one_time_prekey_batch, 100);
        assert_eq!(config.encryption_version, 2);
        assert!(config.verify_signed_prekeys);
        assert_eq!(config.nonce_length, 12);
        assert_eq!(config.aead_tag_length, 16);
    }

    #[test]
    fn test_sync_defaults() {
        let config = Config::default();

        assert_eq!(config.max_send_attempts, 5);
        assert_eq!(config.queue_capacity, 500);
        assert!(config.retry_initial_ms < config.retry_max_ms);
        assert_eq!(
            config.supersede_policy,
            SupersedePolicy::DeleteCancelsPendingSend
        );
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let mut value = 7u32;
        std::env::set_var("PARLEY_TEST_GARBAGE_VALUE", "not-a-number");
        env_override("PARLEY_TEST_GARBAGE_VALUE", &mut value);
        assert_eq!(value, 7);

        std::env::set_var("PARLEY_TEST_GARBAGE_VALUE", "42");
        env_override("PARLEY_TEST_GARBAGE_VALUE", &mut value);
        assert_eq!(value, 42);
    }
}
