//! # droidwire-core
//!
//! Async client library for driving an Android device's UI through an
//! on-device automation agent reachable over HTTP.
//!
//! Elements are found declaratively, either with attribute selectors that the
//! agent resolves or with XPath queries evaluated locally against a
//! hierarchy dump, and then acted on (click, swipe, text entry) without the
//! caller handling JSON-RPC, timeouts or coordinate math.
//!
//! ## Modules
//!
//! - [`device`] - The [`Device`](device::Device) facade: input, apps, and factories for everything below
//! - [`selector`] - Attribute selectors with child/sibling composition
//! - [`ui_object`] - Selector-backed element proxies and the fling builder
//! - [`hierarchy`] - Parsed hierarchy dumps and [`XmlElement`](hierarchy::XmlElement) handles
//! - [`xpath`] - Shorthand compilation, the XPath evaluator, and multi-expression queries
//! - [`watch`] - Background loop that fires callbacks when rules match the screen
//! - [`gateway`] - The [`RpcGateway`](gateway::RpcGateway) transport interface
//! - [`http_gateway`] - HTTP implementation of the gateway
//! - [`config`] - Persistent client settings
//! - [`geometry`] - Bounds, points and directions
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```no_run
//! use droidwire_core::device::Device;
//! use droidwire_core::selector::Selector;
//!
//! # async fn example() -> Result<(), droidwire_core::error::DeviceError> {
//! let device = Device::connect_wifi("192.168.1.20").await?;
//!
//! // Agent-side lookup
//! let wifi = device.select(Selector::new().text("Wi-Fi"));
//! if wifi.wait(true, None).await? {
//!     wifi.click(None, None).await?;
//! }
//!
//! // Local XPath lookup
//! if device.xpath("@android:id/button1").exists().await? {
//!     device.xpath("@android:id/button1").click().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod geometry;
pub mod hierarchy;
pub mod http_gateway;
pub mod selector;
pub mod ui_object;
pub mod watch;
pub mod xpath;
