//! Directorio de destinatarios: orden determinista, validación de las
//! asignaciones que propone el modelo y saneado de destinatarios detectados.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::warn;

use crate::error::InvalidRecipientAssignment;
use crate::models::{DetectedRecipient, RecipientDirectoryEntry, RecipientId};

/// Ordena el directorio: rol (SIGNER < APPROVER < CC), orden de firma
/// ascendente con los que no tienen orden al final, y por último id.
pub fn sort_directory(entries: &mut [RecipientDirectoryEntry]) {
    entries.sort_by(compare_entries);
}

fn compare_entries(a: &RecipientDirectoryEntry, b: &RecipientDirectoryEntry) -> Ordering {
    a.role
        .priority()
        .cmp(&b.role.priority())
        .then_with(|| compare_signing_order(a.signing_order, b.signing_order))
        .then_with(|| a.id.cmp(&b.id))
}

fn compare_signing_order(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Política de validación de la asignación de destinatario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientResolutionPolicy {
    /// Un id fuera del directorio aborta la petición.
    Strict,
    /// Un id fuera del directorio se corrige al de respaldo y se registra.
    Lenient,
}

/// Snapshot de sólo lectura del directorio de una petición, ya ordenado.
#[derive(Debug, Clone)]
pub struct RecipientDirectory {
    entries: Vec<RecipientDirectoryEntry>,
    ids: HashSet<RecipientId>,
}

impl RecipientDirectory {
    /// Devuelve `None` si no hay destinatarios: la detección de campos no
    /// puede continuar sin al menos uno.
    pub fn new(mut entries: Vec<RecipientDirectoryEntry>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        sort_directory(&mut entries);
        let ids = entries.iter().map(|e| e.id).collect();
        Some(Self { entries, ids })
    }

    pub fn entries(&self) -> &[RecipientDirectoryEntry] {
        &self.entries
    }

    pub fn contains(&self, id: RecipientId) -> bool {
        self.ids.contains(&id)
    }

    /// Id de respaldo: la primera entrada según el orden del directorio.
    pub fn fallback_id(&self) -> RecipientId {
        self.entries[0].id
    }

    /// Resuelve el id que propone el modelo para un campo.
    ///
    /// Un id ausente siempre se corrige al de respaldo. Un id desconocido
    /// se corrige o se rechaza según la política.
    pub fn resolve(
        &self,
        proposed: Option<RecipientId>,
        field_label: &str,
        policy: RecipientResolutionPolicy,
    ) -> Result<RecipientId, InvalidRecipientAssignment> {
        match proposed {
            Some(id) if self.contains(id) => Ok(id),
            Some(id) => match policy {
                RecipientResolutionPolicy::Strict => {
                    warn!(
                        recipient_id = id,
                        field = field_label,
                        "El modelo asignó un destinatario que no existe en el directorio"
                    );
                    Err(InvalidRecipientAssignment {
                        recipient_id: id,
                        field_label: field_label.to_string(),
                    })
                }
                RecipientResolutionPolicy::Lenient => {
                    let fallback = self.fallback_id();
                    warn!(
                        recipient_id = id,
                        fallback,
                        field = field_label,
                        "Destinatario desconocido corregido al de respaldo"
                    );
                    Ok(fallback)
                }
            },
            None => {
                let fallback = self.fallback_id();
                warn!(
                    fallback,
                    field = field_label,
                    "Campo sin destinatario asignado; se usa el de respaldo"
                );
                Ok(fallback)
            }
        }
    }
}

/// Validación sintáctica mínima de un email.
pub fn is_plausible_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split('.')
            .filter(|part| !part.is_empty())
            .count()
            >= 2
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Fusiona los destinatarios detectados en varias páginas.
///
/// Deduplica por email (sin distinguir mayúsculas) o, si falta, por nombre;
/// ordena por orden de firma (sin orden al final, luego orden de aparición)
/// y sintetiza emails de marcador para los ausentes o inválidos.
pub fn merge_detected_recipients(
    pages: Vec<Vec<DetectedRecipient>>,
    placeholder_domain: &str,
) -> Vec<DetectedRecipient> {
    let mut merged: Vec<DetectedRecipient> = Vec::new();

    for candidate in pages.into_iter().flatten() {
        let name = candidate.name.trim().to_string();
        let email = candidate
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| is_plausible_email(e));
        if name.is_empty() && email.is_none() {
            continue;
        }
        let candidate = DetectedRecipient {
            name,
            email,
            ..candidate
        };

        let existing = candidate
            .email
            .as_deref()
            .and_then(|email| position_by_email(&merged, email))
            .or_else(|| merged.iter().position(|r| same_name(r, &candidate)));
        match existing {
            Some(index) => {
                let current = &mut merged[index];
                // Si el email ya lo tuviera otra entrada, la búsqueda por
                // email la habría elegido a ella.
                if current.email.is_none() {
                    current.email = candidate.email;
                }
                if current.signing_order.is_none() {
                    current.signing_order = candidate.signing_order;
                }
                if current.name.is_empty() {
                    current.name = candidate.name;
                }
            }
            None => merged.push(candidate),
        }
    }

    // sort_by es estable: a igualdad de orden se conserva la aparición.
    merged.sort_by(|a, b| compare_signing_order(a.signing_order, b.signing_order));

    for (index, recipient) in merged.iter_mut().enumerate() {
        if recipient.email.is_none() {
            recipient.email = Some(format!("recipient.{}@{}", index + 1, placeholder_domain));
        }
        if recipient.name.is_empty() {
            recipient.name = format!("Destinatario {}", index + 1);
        }
    }

    merged
}

fn position_by_email(merged: &[DetectedRecipient], email: &str) -> Option<usize> {
    merged.iter().position(|r| {
        r.email
            .as_deref()
            .is_some_and(|held| held.eq_ignore_ascii_case(email))
    })
}

/// Mismo nombre y, si ambos tienen email, el mismo email.
fn same_name(a: &DetectedRecipient, b: &DetectedRecipient) -> bool {
    let emails_agree = match (&a.email, &b.email) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => true,
    };
    emails_agree && !a.name.is_empty() && a.name.to_lowercase() == b.name.to_lowercase()
}
