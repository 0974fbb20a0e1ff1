//! Amazon SQS transport backed by `aws-sdk-sqs`.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use aws_sdk_sqs::{
    primitives::Blob,
    types::{
        DeleteMessageBatchRequestEntry, Message, MessageAttributeValue,
        MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
    },
    Client,
};
use url::Url;

use super::{
    BatchResult, CreateQueueRequest, DeleteEntry, EntryFailure, IncomingMessage, QueueService,
    ReceiveRequest, SendEntry, SendOptions, SendReceipt,
};
use crate::{message::AttributeValue, QueueError, Result};

/// [`QueueService`] implementation for Amazon SQS and SQS-compatible
/// services (ElasticMQ, LocalStack and friends via the endpoint override).
#[derive(Clone)]
pub struct SqsService {
    client: Client,
    endpoint: Option<Url>,
}

impl SqsService {
    /// Wraps an existing SDK client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: None,
        }
    }

    /// Loads AWS configuration from the ambient environment.
    pub async fn from_env() -> Self {
        let cfg = aws_config::load_from_env().await;
        Self::new(Client::new(&cfg))
    }

    /// Like [`from_env`][Self::from_env], but pointed at an explicit
    /// endpoint such as a local SQS stand-in.
    pub async fn from_env_with_endpoint(endpoint_url: &str) -> Result<Self> {
        let cfg = aws_config::from_env()
            .endpoint_url(endpoint_url)
            .load()
            .await;
        Ok(Self {
            client: Client::new(&cfg),
            endpoint: Some(Url::parse(endpoint_url).map_err(QueueError::generic)?),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn wrap_message(message: &Message) -> IncomingMessage {
        let attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.clone(), decode_attribute(value)))
                    .collect()
            })
            .unwrap_or_default();

        let system_attributes = message
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_owned(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        IncomingMessage {
            id: message.message_id().unwrap_or_default().to_owned(),
            receipt_handle: message.receipt_handle().unwrap_or_default().to_owned(),
            body: message.body().unwrap_or_default().to_owned(),
            attributes,
            system_attributes,
        }
    }
}

fn decode_attribute(value: &MessageAttributeValue) -> AttributeValue {
    match value.data_type() {
        "Binary" => AttributeValue::Binary(
            value
                .binary_value()
                .map(|b| b.as_ref().to_owned())
                .unwrap_or_default(),
        ),
        "Number" => AttributeValue::Number(value.string_value().unwrap_or_default().to_owned()),
        _ => AttributeValue::String(value.string_value().unwrap_or_default().to_owned()),
    }
}

fn encode_attribute(value: &AttributeValue) -> Result<MessageAttributeValue> {
    let builder = match value {
        AttributeValue::String(s) => MessageAttributeValue::builder()
            .data_type("String")
            .string_value(s),
        AttributeValue::Number(n) => MessageAttributeValue::builder()
            .data_type("Number")
            .string_value(n),
        AttributeValue::Binary(b) => MessageAttributeValue::builder()
            .data_type("Binary")
            .binary_value(Blob::new(b.clone())),
    };
    builder.build().map_err(QueueError::generic)
}

fn encode_attributes(
    attributes: &HashMap<String, AttributeValue>,
) -> Result<Option<HashMap<String, MessageAttributeValue>>> {
    if attributes.is_empty() {
        return Ok(None);
    }
    attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), encode_attribute(value)?)))
        .collect::<Result<_>>()
        .map(Some)
}

fn wrap_failure(failed: &aws_sdk_sqs::types::BatchResultErrorEntry) -> EntryFailure {
    EntryFailure {
        id: failed.id().to_owned(),
        code: failed.code().to_owned(),
        message: failed.message().unwrap_or_default().to_owned(),
        sender_fault: failed.sender_fault(),
    }
}

fn secs_i32(d: Duration) -> Result<i32> {
    d.as_secs().try_into().map_err(QueueError::generic)
}

#[async_trait]
impl QueueService for SqsService {
    async fn receive_message(&self, req: ReceiveRequest) -> Result<Vec<IncomingMessage>> {
        let out = self
            .client
            .receive_message()
            .queue_url(&req.queue_url)
            .max_number_of_messages(req.max_messages.try_into().map_err(QueueError::generic)?)
            .wait_time_seconds(secs_i32(req.wait_time)?)
            .set_visibility_timeout(req.visibility_timeout.map(secs_i32).transpose()?)
            .set_message_attribute_names(Some(req.message_attribute_names))
            .set_message_system_attribute_names(Some(
                req.attribute_names
                    .iter()
                    .map(|name| MessageSystemAttributeName::from(name.as_str()))
                    .collect(),
            ))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(out.messages().iter().map(Self::wrap_message).collect())
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult<String>> {
        let entries = entries
            .into_iter()
            .map(|e| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(e.id)
                    .receipt_handle(e.receipt_handle)
                    .build()
                    .map_err(QueueError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(BatchResult {
            successful: out.successful().iter().map(|e| e.id().to_owned()).collect(),
            failed: out.failed().iter().map(wrap_failure).collect(),
        })
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let out = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .set_delay_seconds(opts.delay.map(secs_i32).transpose()?)
            .set_message_attributes(encode_attributes(&opts.attributes)?)
            .set_message_group_id(opts.message_group_id)
            .set_message_deduplication_id(opts.deduplication_id)
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(SendReceipt {
            id: String::new(),
            message_id: out.message_id().unwrap_or_default().to_owned(),
        })
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchResult<SendReceipt>> {
        let entries = entries
            .into_iter()
            .map(|e| {
                SendMessageBatchRequestEntry::builder()
                    .id(e.id)
                    .message_body(e.body)
                    .set_delay_seconds(e.delay.map(secs_i32).transpose()?)
                    .set_message_attributes(encode_attributes(&e.attributes)?)
                    .set_message_group_id(e.message_group_id)
                    .set_message_deduplication_id(e.deduplication_id)
                    .build()
                    .map_err(QueueError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(BatchResult {
            successful: out
                .successful()
                .iter()
                .map(|e| SendReceipt {
                    id: e.id().to_owned(),
                    message_id: e.message_id().to_owned(),
                })
                .collect(),
            failed: out.failed().iter().map(wrap_failure).collect(),
        })
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs_i32(timeout)?)
            .send()
            .await
            .map_err(QueueError::generic)?;
        Ok(())
    }

    async fn create_queue(&self, req: CreateQueueRequest) -> Result<String> {
        let mut call = self.client.create_queue().queue_name(&req.queue_name);
        for (name, value) in req.attributes {
            call = call.attributes(QueueAttributeName::from(name.as_str()), value);
        }
        let out = call.send().await.map_err(QueueError::generic)?;

        out.queue_url()
            .map(ToOwned::to_owned)
            .ok_or_else(|| QueueError::Generic("CreateQueue returned no queue URL".into()))
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.client
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(QueueError::generic)?;
        Ok(())
    }

    async fn purge_queue(&self, queue_url: &str) -> Result<()> {
        self.client
            .purge_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(QueueError::generic)?;
        Ok(())
    }

    async fn get_queue_url(
        &self,
        queue_name: &str,
        account_number: Option<&str>,
    ) -> Result<String> {
        let out = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .set_queue_owner_aws_account_id(account_number.map(ToOwned::to_owned))
            .send()
            .await
            .map_err(QueueError::generic)?;

        out.queue_url()
            .map(ToOwned::to_owned)
            .ok_or_else(|| QueueError::Generic("GetQueueUrl returned no queue URL".into()))
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .set_attribute_names(Some(
                attribute_names
                    .iter()
                    .map(|name| QueueAttributeName::from(*name))
                    .collect(),
            ))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(out
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_owned(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn endpoint(&self) -> Option<Url> {
        self.endpoint.clone()
    }
}
