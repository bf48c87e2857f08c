use std::sync::Arc;

use bytes::Bytes;
use data::message::message_channel_open::ChannelType;
use log::debug;
use sctp::association::Association;
use util::Conn;

use crate::error::Result;

const DATA_CHANNEL_LABEL: &str = "GatewayDataChannel";
const MAX_MESSAGE_SIZE: u32 = 65536;
const MAX_RECEIVE_BUFFER: u32 = 1024 * 1024;

/// SCTP association plus the single negotiated DCEP channel the gateway
/// relays datachannel messages on. Text only, like the rest of the data
/// path.
pub struct DataTransport {
    association: Arc<Association>,
    channel: data::data_channel::DataChannel,
}

impl DataTransport {
    /// Brings the association up over the established DTLS connection
    /// and opens (client) or accepts (server) the relay channel.
    pub async fn connect(
        conn: Arc<dyn Conn + Send + Sync>,
        is_client: bool,
        name: String,
    ) -> Result<Self> {
        let config = sctp::association::Config {
            net_conn: conn,
            max_receive_buffer_size: MAX_RECEIVE_BUFFER,
            max_message_size: MAX_MESSAGE_SIZE,
            name,
        };
        let association = Arc::new(if is_client {
            Association::client(config).await?
        } else {
            Association::server(config).await?
        });
        debug!("SCTP association up (client={is_client})");

        let channel = if is_client {
            data::data_channel::DataChannel::dial(
                &association,
                1,
                data::data_channel::Config {
                    channel_type: ChannelType::Reliable,
                    label: DATA_CHANNEL_LABEL.to_owned(),
                    ..Default::default()
                },
            )
            .await?
        } else {
            let existing: [data::data_channel::DataChannel; 0] = [];
            data::data_channel::DataChannel::accept(
                &association,
                data::data_channel::Config::default(),
                &existing,
            )
            .await?
        };
        debug!("data channel \"{}\" open", channel.config.label);

        Ok(DataTransport {
            association,
            channel,
        })
    }

    /// Reads the next inbound message; returns its length.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.channel.read(buf).await?)
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.channel.write(&Bytes::copy_from_slice(buf)).await?)
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close().await?;
        self.association.close().await?;
        Ok(())
    }
}
