//! Prompt text for the consultation and extraction calls.

const CONSULTANT_SYSTEM_PROMPT: &str = "\
You are a medical assistant who only answers questions about COVID-19: its symptoms, \
prevention, testing and general treatment guidance. Decline questions on any other topic. \
Answer carefully and in detail, but never invent facts; if you do not know, say so. \
The following past patient and assistant exchanges may help you answer:

{context}";

const EXTRACTION_PROMPT: &str = r#"You extract structured health information from a patient's message about COVID-19.

Reply with a single JSON object and nothing else, using these fields:
- "name": string or null, the patient's name
- "age": integer or null, the patient's age
- "symptoms": list of strings, symptoms the patient has now
- "health_conditions": list of strings, pre-existing conditions the patient mentions
- "family_members": list of objects, each with
    "relation" (string, e.g. "mother", "son"), "name" (string or null),
    "age" (integer or null), "condition" (list of strings), "symptoms" (list of strings)

Use null or an empty list for anything the message does not mention.

Example message:
"Hi, I'm John, 42. I have a sore throat and fever. My father has diabetes."

Example reply:
{"name": "John", "age": 42, "symptoms": ["sore throat", "fever"], "health_conditions": [],
 "family_members": [{"relation": "father", "name": null, "age": null, "condition": ["diabetes"], "symptoms": []}]}

Message:
{message}"#;

pub fn consultant_system_prompt(context: &str) -> String {
    CONSULTANT_SYSTEM_PROMPT.replace("{context}", context)
}

pub fn extraction_prompt(message: &str) -> String {
    EXTRACTION_PROMPT.replace("{message}", message)
}
