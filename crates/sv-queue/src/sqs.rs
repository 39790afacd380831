use async_trait::async_trait;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, MessageAttributeValue as SqsAttributeValue,
    MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use sv_common::{MessageAttributeValue, OutgoingMessage, QueueAttributes, ReceivedMessage, MAX_BATCH_SIZE};

use crate::{queue_name_from_ref, BatchFailure, DeleteEntry, QueueClient, QueueError, ReceiveRequest, Result};

/// AWS SQS backend.
///
/// Queue URLs are resolved once per name and cached. Queue attributes are
/// cached too when `cache_attributes` is set.
pub struct SqsQueueClient {
    client: Client,
    default_wait_time_seconds: i32,
    cache_attributes: bool,
    urls: DashMap<String, String>,
    attributes: DashMap<String, QueueAttributes>,
}

impl SqsQueueClient {
    /// Default long poll wait time in seconds. AWS SQS max is 20.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

    pub fn new(client: Client) -> Self {
        Self {
            client,
            default_wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            cache_attributes: false,
            urls: DashMap::new(),
            attributes: DashMap::new(),
        }
    }

    /// Build a client from the default AWS credential chain, optionally pinning
    /// a region and an endpoint (LocalStack, ElasticMQ).
    pub async fn connect(region: Option<String>, endpoint_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = endpoint_url {
            info!(endpoint = %endpoint, "Configuring SQS client with custom endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.default_wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    pub fn with_attribute_cache(mut self, enabled: bool) -> Self {
        self.cache_attributes = enabled;
        self
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Resolve a queue name or URL to a queue URL.
    pub async fn queue_url(&self, queue: &str) -> Result<String> {
        if queue.starts_with("http://") || queue.starts_with("https://") {
            return Ok(queue.to_string());
        }
        if let Some(url) = self.urls.get(queue) {
            return Ok(url.clone());
        }

        let result = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_queue_does_not_exist())
                    .unwrap_or(false);
                if missing {
                    QueueError::QueueNotFound(queue.to_string())
                } else {
                    QueueError::Sqs(e.to_string())
                }
            })?;

        let url = result
            .queue_url()
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?
            .to_string();
        debug!(queue = %queue, url = %url, "Resolved queue URL");
        self.urls.insert(queue.to_string(), url.clone());
        Ok(url)
    }

    fn convert_message(queue_name: &str, message: &aws_sdk_sqs::types::Message) -> Option<ReceivedMessage> {
        let receipt_handle = match message.receipt_handle() {
            Some(handle) => handle.to_string(),
            None => {
                warn!(queue = %queue_name, "Dropping SQS message without receipt handle");
                return None;
            }
        };

        let attributes = message
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let message_attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            MessageAttributeValue {
                                data_type: v.data_type().to_string(),
                                string_value: v.string_value().map(str::to_string),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(ReceivedMessage {
            message_id: message.message_id().unwrap_or_default().to_string(),
            body: message.body().unwrap_or_default().to_string(),
            attributes,
            message_attributes,
            receipt_handle,
            queue_name: queue_name.to_string(),
        })
    }

    fn outgoing_attributes(message: &OutgoingMessage) -> Result<Option<HashMap<String, SqsAttributeValue>>> {
        if message.message_attributes.is_empty() {
            return Ok(None);
        }
        let mut converted = HashMap::with_capacity(message.message_attributes.len());
        for (name, value) in &message.message_attributes {
            let attr = SqsAttributeValue::builder()
                .data_type(&value.data_type)
                .set_string_value(value.string_value.clone())
                .build()
                .map_err(|e| QueueError::InvalidParameter(e.to_string()))?;
            converted.insert(name.clone(), attr);
        }
        Ok(Some(converted))
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_messages(&self, queue: &str, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let url = self.queue_url(queue).await?;
        let queue_name = queue_name_from_ref(queue);

        let mut call = self
            .client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(request.max_messages.min(MAX_BATCH_SIZE) as i32)
            .wait_time_seconds(request.wait_time_seconds.unwrap_or(self.default_wait_time_seconds))
            .message_system_attribute_names(MessageSystemAttributeName::All);
        for name in &request.message_attribute_names {
            call = call.message_attribute_names(name);
        }
        if let Some(visibility) = request.visibility_timeout {
            call = call.visibility_timeout(visibility);
        }

        let result = call.send().await.map_err(|e| QueueError::Sqs(e.to_string()))?;

        let messages: Vec<ReceivedMessage> = result
            .messages()
            .iter()
            .filter_map(|m| Self::convert_message(queue_name, m))
            .collect();

        if !messages.is_empty() {
            debug!(queue = %queue_name, count = messages.len(), "Received messages from SQS");
        }
        Ok(messages)
    }

    async fn delete_messages(&self, queue: &str, entries: Vec<DeleteEntry>) -> Result<Vec<BatchFailure>> {
        let url = self.queue_url(queue).await?;
        let mut failures = Vec::new();

        for chunk in entries.chunks(MAX_BATCH_SIZE) {
            let mut call = self.client.delete_message_batch().queue_url(&url);
            for entry in chunk {
                let request_entry = DeleteMessageBatchRequestEntry::builder()
                    .id(&entry.id)
                    .receipt_handle(&entry.receipt_handle)
                    .build()
                    .map_err(|e| QueueError::InvalidParameter(e.to_string()))?;
                call = call.entries(request_entry);
            }

            let result = call.send().await.map_err(|e| QueueError::Sqs(e.to_string()))?;
            for failed in result.failed() {
                failures.push(BatchFailure {
                    id: failed.id().to_string(),
                    code: failed.code().to_string(),
                    message: failed.message().map(str::to_string),
                    sender_fault: failed.sender_fault(),
                });
            }
        }

        if !failures.is_empty() {
            warn!(queue = %queue_name_from_ref(queue), failed = failures.len(), "SQS batch delete had failures");
        }
        Ok(failures)
    }

    async fn send_message(&self, queue: &str, message: OutgoingMessage) -> Result<String> {
        let url = self.queue_url(queue).await?;
        let attributes = Self::outgoing_attributes(&message)?;

        let result = self
            .client
            .send_message()
            .queue_url(&url)
            .message_body(message.body)
            .set_delay_seconds(message.delay_seconds.map(|d| d as i32))
            .set_message_group_id(message.message_group_id)
            .set_message_deduplication_id(message.message_deduplication_id)
            .set_message_attributes(attributes)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(result.message_id().unwrap_or_default().to_string())
    }

    async fn send_messages(&self, queue: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<BatchFailure>> {
        let url = self.queue_url(queue).await?;
        let mut failures = Vec::new();

        for (chunk_index, chunk) in messages.chunks(MAX_BATCH_SIZE).enumerate() {
            let mut call = self.client.send_message_batch().queue_url(&url);
            for (i, message) in chunk.iter().enumerate() {
                let entry = SendMessageBatchRequestEntry::builder()
                    .id((chunk_index * MAX_BATCH_SIZE + i).to_string())
                    .message_body(&message.body)
                    .set_delay_seconds(message.delay_seconds.map(|d| d as i32))
                    .set_message_group_id(message.message_group_id.clone())
                    .set_message_deduplication_id(message.message_deduplication_id.clone())
                    .set_message_attributes(Self::outgoing_attributes(message)?)
                    .build()
                    .map_err(|e| QueueError::InvalidParameter(e.to_string()))?;
                call = call.entries(entry);
            }

            let result = call.send().await.map_err(|e| QueueError::Sqs(e.to_string()))?;
            for failed in result.failed() {
                failures.push(BatchFailure {
                    id: failed.id().to_string(),
                    code: failed.code().to_string(),
                    message: failed.message().map(str::to_string),
                    sender_fault: failed.sender_fault(),
                });
            }
        }
        Ok(failures)
    }

    async fn get_attributes(&self, queue: &str) -> Result<QueueAttributes> {
        if self.cache_attributes {
            if let Some(cached) = self.attributes.get(queue) {
                return Ok(*cached);
            }
        }

        let url = self.queue_url(queue).await?;
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&url)
            .attribute_names(QueueAttributeName::VisibilityTimeout)
            .attribute_names(QueueAttributeName::FifoQueue)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let attrs = result.attributes();
        let defaults = QueueAttributes::default();
        let visibility_timeout = attrs
            .and_then(|a| a.get(&QueueAttributeName::VisibilityTimeout))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.visibility_timeout);
        let fifo = attrs
            .and_then(|a| a.get(&QueueAttributeName::FifoQueue))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or_else(|| queue.ends_with(".fifo"));

        let attributes = QueueAttributes { visibility_timeout, fifo };
        if self.cache_attributes {
            self.attributes.insert(queue.to_string(), attributes);
        }
        Ok(attributes)
    }

    async fn change_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> Result<()> {
        let url = self.queue_url(queue).await?;
        self.client
            .change_message_visibility()
            .queue_url(&url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue = %queue_name_from_ref(queue), seconds = seconds, "Visibility changed in SQS");
        Ok(())
    }
}
