mod message;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Message)] derive macro
// ============================================================================

/// Derive macro for the `Message` trait.
///
/// # Usage
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Message)]
/// struct OrderPlaced {
///     pub order_id: String,
/// }
///
/// #[derive(Serialize, Deserialize, Message)]
/// #[message(command, name = "billing.charge-card")]
/// struct ChargeCard {
///     pub order_id: String,
///     pub amount: u64,
/// }
/// ```
///
/// - `#[message(name = "...")]` sets the type name carried on the wire.
///   If omitted, defaults to the struct identifier.
/// - `#[message(command)]` marks the type as a command (point-to-point).
///   `#[message(event)]` is the default (fan-out).
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    message::derive_message(input)
}
