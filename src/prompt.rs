//! Construcción de las instrucciones que se envían al modelo multimodal.
//!
//! Funciones puras: el directorio se vuelca en el mismo orden en que se
//! resuelven los empates, de modo que el modelo vea el orden de firma como
//! prioridad posicional.

use crate::models::{FieldType, RecipientDirectoryEntry};
use crate::recipients::RecipientDirectory;

const FIELD_DETECTION_PROMPT: &str = r#"
Eres un experto en preparar documentos para firma electrónica.
Analiza la imagen de UNA página de un documento y localiza todas las zonas que una persona debe rellenar.

TIPOS DE CAMPO (usa exactamente uno por zona):
- SIGNATURE: línea o recuadro para una firma manuscrita.
- INITIALS: espacio pequeño para iniciales, a menudo al pie de página.
- NAME: nombre completo de una persona.
- EMAIL: dirección de correo electrónico.
- DATE: fecha (incluye "Fecha", "Date", "__/__/____").
- TEXT: cualquier otro texto libre de una línea.
- NUMBER: importes, cantidades, números de documento.
- CHECKBOX: casilla cuadrada marcable.
- RADIO: opción circular excluyente.
- DROPDOWN: selección entre opciones predefinidas.

GEOMETRÍA:
- Devuelve cada zona como "boundingBox": [ymin, xmin, ymax, xmax] normalizado a 0-1000
  (0,0 es la esquina superior izquierda de la página; 1000,1000 la inferior derecha).
- La caja cubre SÓLO el área rellenable. Las etiquetas impresas ("Firma:", "Nombre:") NO forman parte del campo.
- Para CHECKBOX y RADIO la caja es exactamente el símbolo marcable.

CAMPOS SOBRE LÍNEA (SIGNATURE, INITIALS, NAME, EMAIL, DATE, TEXT, NUMBER):
1. Localiza la línea o subrayado: su coordenada y es el borde inferior (ymax) del campo.
2. Mira hacia arriba hasta el siguiente obstáculo (texto, otra línea, borde de tabla).
3. Extiende ymin hacia arriba ocupando entre el 60% y el 80% de ese espacio libre.
4. Alto mínimo 30 unidades y ancho mínimo 36 unidades; nunca uses ymin menor que 0.
5. El ancho es el de la línea, sin incluir la etiqueta.

Incluye "label" con el texto de la etiqueta asociada si existe y "confidence" entre 0 y 1.
Si la página no tiene campos rellenables devuelve una lista vacía.
"#;

const RECIPIENT_DETECTION_PROMPT: &str = r#"
Eres un experto en preparar documentos para firma electrónica.
Analiza la imagen de una página e identifica a las personas que deben firmar, aprobar o recibir copia del documento.

Para cada persona devuelve:
- "name": nombre completo tal y como aparece (o un rol descriptivo como "Arrendatario" si no hay nombre).
- "email": sólo si aparece escrito en el documento; si no, omítelo. No inventes direcciones.
- "role": SIGNER si debe firmar, APPROVER si debe aprobar, CC si sólo recibe copia.
- "signingOrder": posición en el orden de firma (1 = primero) si el documento lo indica.

No repitas personas. Si no hay destinatarios identificables devuelve una lista vacía.
"#;

/// Instrucciones de detección de campos, con directorio opcional y contexto libre.
pub fn build_field_detection_prompt(
    directory: Option<&RecipientDirectory>,
    context: Option<&str>,
) -> String {
    let mut prompt = FIELD_DETECTION_PROMPT.trim().to_string();

    if let Some(directory) = directory {
        let entries = directory.entries();
        if !entries.is_empty() {
            prompt.push_str("\n\nRECIPIENT DIRECTORY\n");
            for entry in entries {
                prompt.push_str(&render_directory_line(entry));
                prompt.push('\n');
            }
            prompt.push_str(&assignment_rules(entries));
        }
    }

    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nCONTEXTO ADICIONAL DEL USUARIO:\n");
        prompt.push_str(context);
    }

    prompt
}

/// Instrucciones de detección de destinatarios.
pub fn build_recipient_detection_prompt() -> String {
    RECIPIENT_DETECTION_PROMPT.trim().to_string()
}

fn render_directory_line(entry: &RecipientDirectoryEntry) -> String {
    let mut line = format!(
        "- id: {} | nombre: {} | rol: {}",
        entry.id,
        entry.display_name,
        entry.role.as_str()
    );
    if let Some(email) = &entry.email {
        line.push_str(&format!(" | email: {email}"));
    }
    if let Some(order) = entry.signing_order {
        line.push_str(&format!(" | orden de firma: {order}"));
    }
    line
}

fn assignment_rules(entries: &[RecipientDirectoryEntry]) -> String {
    let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
    format!(
        "\nASSIGNMENT RULES\n\
         - Cada campo devuelto DEBE incluir \"recipientId\".\n\
         - \"recipientId\" sólo puede ser uno de: {}.\n\
         - Asigna cada campo a la persona cuyo nombre, rol o etiqueta aparece junto a él.\n\
         - Si no hay pista clara, usa el primer destinatario de la lista ({}); el orden de la lista es el orden de firma.\n\
         - Los tipos de campo válidos son: {}.\n",
        ids.join(", "),
        entries[0].id,
        FieldType::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
