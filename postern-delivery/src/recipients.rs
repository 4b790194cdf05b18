use std::collections::HashMap;

use postern_common::{Recipient, RecipientId};

/// Addresses of the recipients in `ids` that can receive mail.
///
/// Ids that did not resolve, or that resolved to a disabled or incomplete
/// identity, are dropped. Input order is preserved, and an id listed twice
/// contributes its address once.
#[must_use]
pub fn deliverable_emails(
    ids: &[RecipientId],
    resolved: &HashMap<RecipientId, Recipient>,
) -> Vec<String> {
    let mut seen = Vec::with_capacity(ids.len());
    let mut emails = Vec::with_capacity(ids.len());

    for id in ids {
        if seen.contains(&id) {
            continue;
        }
        seen.push(id);

        if let Some(recipient) = resolved.get(id)
            && recipient.is_deliverable()
        {
            emails.push(recipient.email.clone());
        }
    }

    emails
}
