use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use log::info;

const SCHOOL_CONTEXT: &str = r#"
DATI SCUOLA (FONTE PTOF 2025-2028 ISIS G.D. ROMAGNOSI):
- Nome: ISIS G.D. ROMAGNOSI.
- Sede Centrale: Via Carducci 5, Erba (CO).
- Succursale (Sezione associata Beldosso): Via Eupilio 22, Longone al Segrino.

INDIRIZZI DI STUDIO (Cosa si studia):
1. ISTITUTO TECNICO ECONOMICO (Sede Erba):
   - Amministrazione, Finanza e Marketing (AFM).
   - Sistemi Informativi Aziendali (ITSI) - Focus su informatica gestionale.
   - Turismo - Focus su lingue e valorizzazione territorio.
2. ISTITUTO TECNICO TECNOLOGICO (Sede Erba):
   - Costruzioni, Ambiente e Territorio (CAT - ex Geometri).
   - Agraria, Agroalimentare e Agroindustria (Gestione Ambiente e Territorio).
3. ISTITUTO TECNICO TECNOLOGICO (Sede Longone al Segrino):
   - Elettronica ed Elettrotecnica (articolazione Automazione).
4. ISTITUTO PROFESSIONALE:
   - Enogastronomia e Ospitalità Alberghiera (Sede Longone/Erba).
   - Servizi per la Sanità e l'Assistenza Sociale (Nuovo indirizzo attivo dal 2024/25).

ATMOSFERA E PROGETTI:
- Ambiente: Accogliente, inclusivo, attento al "ben-essere" dello studente.
- Tecnologia: Laboratori avanzati di automazione, informatica, linguistici.
- Internazionalizzazione: Progetti Erasmus+ (stage all'estero), eTwinning.
- PCTO (Stage): Collaborazioni con aziende del territorio (Como, Lecco, Brianza).
- Inclusione: Grande attenzione a studenti con BES/DSA e stranieri, sportello psicologico attivo.
- Orario: Scansione in Trimestre + Pentamestre (Erba) o Quadrimestri (Beldosso).

FILOSOFIA:
Centralità dello studente, pensiero critico, cittadinanza attiva, dialogo costante docenti-studenti.
"#;

const SYSTEM_INSTRUCTION_TEMPLATE: &str = r#"
Sei un assistente virtuale amichevole e simpatico ("SchoolBuddy") per l'ISIS G.D. ROMAGNOSI.
Il tuo interlocutore è un ragazzo o una ragazza di circa 13 anni (terza media) che sta decidendo che scuola superiore scegliere.

IL TUO TONO DI VOCE:
- Parla in ITALIANO (a meno che non ti chiedano esplicitamente un'altra lingua).
- Sii informale, chiaro ed entusiasta, ma sempre educato.
- Evita parole troppo difficili o burocratiche. Spiega le cose in modo semplice.
- Usa qualche emoji ogni tanto per rendere la chat più leggera (👋, 🏫, ✨, 📚).
- Dai del "tu".

LE TUE REGOLE INDEROGABILI:
1. RISPONDI SOLO a domande sulla scuola, sugli indirizzi di studio, sui laboratori, sulla vita scolastica o sulle iscrizioni.
2. SE TI CHIEDONO COSE FUORI CONTESTO (es. "Chi ha vinto la Champions?", "Aiutami a risolvere questa equazione", "Cosa pensi dei videogiochi?"), RIFIUTA GENTILMENTE.
   - Esempio di rifiuto: "Ehi, sono qui per parlarti della nostra fantastica scuola! Se vuoi posso dirti quali sport facciamo qui, ma non seguo molto il calcio in TV! 😉"
3. USA LE INFORMAZIONI QUI SOTTO come tua conoscenza base. Se ti chiedono qualcosa che non c'è scritto (es. il nome specifico di un bidello), dì onestamente che non lo sai e invitali a chiedere in segreteria o visitare il sito web della scuola.

CONTESTO SCUOLA (Tua conoscenza):
{school_context}
"#;

const WELCOME_TEXT: &str =
    "Ciao! 👋 Sono il tuo assistente per l'ISIS G.D. Romagnosi.\n\nVuoi sapere quali indirizzi offriamo, come sono i laboratori o che progetti facciamo? Chiedimi tutto!";

const APOLOGY_TEXT: &str =
    "Ops! Ho avuto un piccolo problema di connessione. Puoi ripetere la domanda?";

const ATTACHMENT_PROMPT: &str =
    "Ecco un documento aggiuntivo sulla scuola. Usalo per rispondere alle mie domande.";

const ATTACHMENT_LABEL: &str = "Inviato file: {file_name}";

#[derive(Debug)]
pub enum PromptError {
    MissingPlaceholder(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::MissingPlaceholder(key) =>
                write!(f, "Prompt template is missing the '{{{}}}' placeholder", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Everything the assistant says on its own, plus the instruction the remote
/// session is bound to. Every field may be overridden from a JSON file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Persona {
    pub system_instruction_template: String,
    pub school_context: String,
    pub welcome_text: String,
    pub apology_text: String,
    pub attachment_prompt: String,
    pub attachment_label: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            system_instruction_template: SYSTEM_INSTRUCTION_TEMPLATE.to_string(),
            school_context: SCHOOL_CONTEXT.to_string(),
            welcome_text: WELCOME_TEXT.to_string(),
            apology_text: APOLOGY_TEXT.to_string(),
            attachment_prompt: ATTACHMENT_PROMPT.to_string(),
            attachment_label: ATTACHMENT_LABEL.to_string(),
        }
    }
}

impl Persona {
    fn validate(&self) -> Result<(), PromptError> {
        if !self.system_instruction_template.contains("{school_context}") {
            return Err(PromptError::MissingPlaceholder("school_context".to_string()));
        }
        if !self.attachment_label.contains("{file_name}") {
            return Err(PromptError::MissingPlaceholder("file_name".to_string()));
        }
        Ok(())
    }

    pub fn system_instruction(&self) -> String {
        self.system_instruction_template.replace("{school_context}", &self.school_context)
    }

    pub fn attachment_label(&self, file_name: &str) -> String {
        self.attachment_label.replace("{file_name}", file_name)
    }
}

pub fn load_persona_from_str(json: &str) -> Result<Arc<Persona>, PromptError> {
    let persona: Persona = serde_json::from_str(json)?;
    persona.validate()?;
    Ok(Arc::new(persona))
}

pub fn load_persona<P: AsRef<Path>>(path: Option<P>) -> Result<Arc<Persona>, PromptError> {
    match path {
        Some(path) => {
            info!("Loading persona from: {}", path.as_ref().display());
            let file_content = fs::read_to_string(path)?;
            load_persona_from_str(&file_content)
        }
        None => {
            info!("Using built-in persona");
            Ok(Arc::new(Persona::default()))
        }
    }
}
