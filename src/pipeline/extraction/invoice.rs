//! Heuristic "is this an invoice?" flag.
//!
//! Only decides whether the outgoing message carries the invoice
//! extraction checklist. It never changes what was extracted.

/// Keywords that mark a document as invoice-like. Order matters only for
/// which keyword short-circuits first.
const INVOICE_KEYWORDS: &[&str] = &[
    "invoice",
    "receipt",
    "bill to",
    "ship to",
    "payment terms",
    "due date",
    "invoice number",
    "order number",
    "tax",
    "total",
    "subtotal",
    "amount due",
    "quantity",
    "unit price",
    "account number",
    "po number",
];

const FILENAME_MARKERS: &[&str] = &["invoice", "receipt"];

/// Checklist appended to the outgoing message for invoice-like documents.
pub const INVOICE_CHECKLIST: &str = "\
This appears to be an invoice or receipt. Please extract:
- Invoice number
- Invoice date and due date
- Vendor or company name and address
- Bill-to and ship-to details
- Line items (description, quantity, unit price, amount)
- Subtotal, tax and total amount due
- Payment terms and account / PO numbers";

/// True when the filename or the text looks like an invoice or receipt.
/// Case-insensitive substring match.
pub fn classify_invoice(text: &str, filename: &str) -> bool {
    let name = filename.to_lowercase();
    if let Some(marker) = FILENAME_MARKERS.iter().find(|m| name.contains(*m)) {
        tracing::debug!(marker = *marker, "Invoice marker in filename");
        return true;
    }

    let lower = text.to_lowercase();
    match INVOICE_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        Some(keyword) => {
            tracing::debug!(keyword = *keyword, "Invoice keyword in text");
            true
        }
        None => false,
    }
}
