//! Durable очередь исходящих операций
//!
//! Хранится одним JSON-массивом под ключом `queue/operations` и
//! переписывается целиком при каждом изменении. Размер ограничен:
//! при переполнении вытесняется самая старая операция.

use crate::config::SupersedePolicy;
use crate::storage::backend::StorageBackend;
use crate::storage::models::{OperationPayload, OperationStatus, QueuedOperation};
use crate::sync::retry::RetryPolicy;
use crate::utils::error::{CoreError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const QUEUE_KEY: &str = "queue/operations";

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued {
        /// Операция, вытесненная из-за лимита
        evicted: Option<QueuedOperation>,
    },
    /// Delete отменил ещё не отправленный send; в сеть ничего не уйдёт
    Superseded { cancelled: Vec<QueuedOperation> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempts: u32, next_attempt_at: i64 },
    Exhausted { attempts: u32 },
}

/// Снимает флаг обработки при drop
pub struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct OperationQueue {
    backend: Arc<dyn StorageBackend>,
    ops: Mutex<Vec<QueuedOperation>>,
    capacity: usize,
    supersede_policy: SupersedePolicy,
    is_processing: AtomicBool,
}

impl OperationQueue {
    /// Загрузить очередь. Операции, застрявшие в `processing` (процесс
    /// упал посреди отправки), возвращаются в `pending`.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        capacity: usize,
        supersede_policy: SupersedePolicy,
    ) -> Result<Self> {
        let mut ops: Vec<QueuedOperation> = match backend.get(QUEUE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::StorageError(format!("corrupted queue: {}", e)))?,
            None => Vec::new(),
        };

        let mut reset = 0;
        for op in ops.iter_mut() {
            if op.status == OperationStatus::Processing {
                op.status = OperationStatus::Pending;
                reset += 1;
            }
        }

        let queue = Self {
            backend,
            ops: Mutex::new(ops),
            capacity: capacity.max(1),
            supersede_policy,
            is_processing: AtomicBool::new(false),
        };

        if reset > 0 {
            let ops = queue.ops.lock();
            queue.persist(&ops)?;
            info!(target: "storage::queue", reset, "Reset interrupted operations to pending");
        }
        debug!(target: "storage::queue", len = queue.len(), "Operation queue opened");
        Ok(queue)
    }

    fn persist(&self, ops: &[QueuedOperation]) -> Result<()> {
        let bytes = serde_json::to_vec(ops)?;
        self.backend.put(QUEUE_KEY, &bytes)?;
        self.backend.flush()
    }

    /// Применить изменение и сохранить; при ошибке записи откатить
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<QueuedOperation>) -> T) -> Result<T> {
        let mut ops = self.ops.lock();
        let snapshot = ops.clone();
        let result = f(&mut ops);
        if let Err(e) = self.persist(&ops) {
            *ops = snapshot;
            return Err(e);
        }
        Ok(result)
    }

    pub fn enqueue(&self, op: QueuedOperation) -> Result<EnqueueOutcome> {
        let capacity = self.capacity;
        let supersede = self.supersede_policy;

        self.mutate(move |ops| {
            if let (SupersedePolicy::DeleteCancelsPendingSend, OperationPayload::DeleteMessage { message_id, .. }) =
                (supersede, &op.payload)
            {
                let has_unsent = ops.iter().any(|queued| {
                    matches!(queued.payload, OperationPayload::SendMessage { .. })
                        && queued.payload.message_id() == message_id
                        && queued.status != OperationStatus::Processing
                });
                if has_unsent {
                    // Всё, что относится к неотправленному сообщению, уходит вместе с ним
                    let (cancelled, kept): (Vec<_>, Vec<_>) = ops.drain(..).partition(|queued| {
                        queued.payload.message_id() == message_id
                            && queued.status != OperationStatus::Processing
                    });
                    *ops = kept;
                    return EnqueueOutcome::Superseded { cancelled };
                }
            }

            let mut evicted = None;
            if ops.len() >= capacity {
                let index = ops
                    .iter()
                    .position(|queued| queued.status != OperationStatus::Processing)
                    .unwrap_or(0);
                let old = ops.remove(index);
                warn!(
                    target: "storage::queue",
                    error = %CoreError::QueueCapacityExceeded(format!("capacity {}", capacity)),
                    evicted_id = %old.id,
                    evicted_type = old.op_type(),
                    "Evicted oldest operation"
                );
                evicted = Some(old);
            }

            ops.push(op);
            EnqueueOutcome::Enqueued { evicted }
        })
    }

    /// Первая операция беседы, если она готова к отправке.
    ///
    /// Failed операции пропускаются; не готовая операция блокирует все
    /// следующие в той же беседе.
    pub fn next_due(&self, conversation_id: &str, now: i64) -> Option<QueuedOperation> {
        let ops = self.ops.lock();
        let head = ops.iter().find(|op| {
            op.conversation_id == conversation_id && op.status != OperationStatus::Failed
        })?;
        head.is_due(now).then(|| head.clone())
    }

    /// Беседы с ожидающими операциями, в порядке первой операции
    pub fn conversations_with_pending(&self) -> Vec<String> {
        let ops = self.ops.lock();
        let mut conversations: Vec<String> = Vec::new();
        for op in ops.iter().filter(|op| op.status == OperationStatus::Pending) {
            if !conversations.contains(&op.conversation_id) {
                conversations.push(op.conversation_id.clone());
            }
        }
        conversations
    }

    /// Начать попытку: `attempts + 1`, статус `processing`
    pub fn mark_processing(&self, id: &str, now: i64) -> Result<Option<QueuedOperation>> {
        self.mutate(|ops| {
            let op = ops.iter_mut().find(|op| op.id == id)?;
            op.status = OperationStatus::Processing;
            op.attempts += 1;
            op.last_attempt_at = Some(now);
            Some(op.clone())
        })
    }

    /// Сохранить зашифрованный payload, чтобы повтор не шифровал заново
    pub fn update_payload(&self, id: &str, payload: OperationPayload) -> Result<bool> {
        self.mutate(|ops| match ops.iter_mut().find(|op| op.id == id) {
            Some(op) => {
                op.payload = payload;
                true
            }
            None => false,
        })
    }

    /// Операция подтверждена, удалить
    pub fn complete(&self, id: &str) -> Result<Option<QueuedOperation>> {
        self.mutate(|ops| {
            let index = ops.iter().position(|op| op.id == id)?;
            Some(ops.remove(index))
        })
    }

    /// Зафиксировать неудачную попытку
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        now: i64,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        self.mutate(|ops| {
            let op = ops
                .iter_mut()
                .find(|op| op.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("operation {}", id)))?;
            op.error = Some(error.to_string());
            let in_epoch = op.attempts.saturating_sub(op.attempts_base);

            if policy.is_exhausted(in_epoch) {
                op.status = OperationStatus::Failed;
                Ok(FailureOutcome::Exhausted {
                    attempts: op.attempts,
                })
            } else {
                op.status = OperationStatus::Pending;
                op.next_attempt_at = now + policy.delay_for(in_epoch).as_millis() as i64;
                Ok(FailureOutcome::Retrying {
                    attempts: op.attempts,
                    next_attempt_at: op.next_attempt_at,
                })
            }
        })?
    }

    /// Вернуть failed операцию в очередь по явному запросу пользователя.
    /// Счётчик попыток не сбрасывается, новый потолок отсчитывается от него.
    pub fn rearm(&self, id: &str, now: i64) -> Result<bool> {
        self.mutate(|ops| {
            match ops
                .iter_mut()
                .find(|op| op.id == id && op.status == OperationStatus::Failed)
            {
                Some(op) => {
                    op.status = OperationStatus::Pending;
                    op.attempts_base = op.attempts;
                    op.error = None;
                    op.next_attempt_at = now;
                    true
                }
                None => false,
            }
        })
    }

    /// Все операции (включая failed) для сообщения
    pub fn find_by_message(&self, message_id: &str) -> Vec<QueuedOperation> {
        self.ops
            .lock()
            .iter()
            .filter(|op| op.payload.message_id() == message_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<QueuedOperation> {
        self.ops.lock().iter().find(|op| op.id == id).cloned()
    }

    pub fn all(&self) -> Vec<QueuedOperation> {
        self.ops.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Захватить право на обработку очереди. `None`, если обработка уже идёт.
    pub fn try_begin_processing(&self) -> Option<ProcessingGuard<'_>> {
        self.is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessingGuard {
                flag: &self.is_processing,
            })
    }
}
