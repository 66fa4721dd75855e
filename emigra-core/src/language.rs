//! Interview languages and the prompts built for each.

use serde::Serialize;

/// A language the interviewer can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
    #[serde(skip)]
    greeting: &'static str,
}

pub const LANGUAGES: &[Language] = &[
    Language {
        code: "es",
        name: "Español",
        greeting: "¡Hola! Soy EmigraBot. Voy a hacerte unas preguntas para evaluar tu caso. ¿Cuál es tu nacionalidad?",
    },
    Language {
        code: "en",
        name: "English",
        greeting: "Hi! I'm EmigraBot. I'll ask you a few questions to evaluate your case. What is your nationality?",
    },
    Language {
        code: "fr",
        name: "Français",
        greeting: "Bonjour ! Je suis EmigraBot. Je vais vous poser quelques questions pour évaluer votre dossier. Quelle est votre nationalité ?",
    },
    Language {
        code: "pt",
        name: "Português",
        greeting: "Olá! Sou o EmigraBot. Vou fazer algumas perguntas para avaliar o seu caso. Qual é a sua nacionalidade?",
    },
    Language {
        code: "ar",
        name: "العربية",
        greeting: "مرحباً! أنا EmigraBot. سأطرح عليك بعض الأسئلة لتقييم حالتك. ما هي جنسيتك؟",
    },
    Language {
        code: "ro",
        name: "Română",
        greeting: "Bună! Sunt EmigraBot. Îți voi pune câteva întrebări pentru a-ți evalua cazul. Care este naționalitatea ta?",
    },
    Language {
        code: "uk",
        name: "Українська",
        greeting: "Привіт! Я EmigraBot. Я поставлю кілька запитань, щоб оцінити вашу справу. Яке ваше громадянство?",
    },
    Language {
        code: "zh",
        name: "中文",
        greeting: "你好！我是 EmigraBot。我会问你几个问题来评估你的情况。你的国籍是什么？",
    },
];

/// Used when a code is not in the catalogue.
pub const FALLBACK: Language = LANGUAGES[1];

impl Language {
    /// Look up a language by its code, falling back to English.
    pub fn from_code(code: &str) -> Language {
        let code = code.trim();
        LANGUAGES
            .iter()
            .copied()
            .find(|l| l.code.eq_ignore_ascii_case(code))
            .unwrap_or(FALLBACK)
    }

    /// Opening line of the text interview.
    pub fn greeting(&self) -> &'static str {
        self.greeting
    }

    /// Instructions for the spoken interview.
    pub fn voice_prompt(&self) -> String {
        format!(
            "You are EmigraBot, an immigration expert for Spain. Short spoken interview.\n\
             Speak in: {name} ({code}).\n\
             Ask 1 by 1: Nationality, time in Spain, legal status, job offer, criminal record.\n\
             Be brief and conversational. If you have all data, call 'complete_evaluation'.",
            name = self.name,
            code = self.code,
        )
    }

    /// Instructions for the written interview, which digs deeper into legal status.
    pub fn chat_prompt(&self) -> String {
        format!(
            "Act as EmigraBot, an expert immigration consultant for Spain.\n\
             Your goal is to evaluate the viability of the user's case via a short interview.\n\
             Current Language: {name} ({code}).\n\
             YOU MUST SPEAK IN {upper}.\n\
             \n\
             The user has seen your greeting. Wait for their nationality.\n\
             Ask questions ONE BY ONE. Do not overwhelm.\n\
             Interview flow (never skip steps):\n\
             1. Time in Spain.\n\
             2. LEGAL STATUS DEEP DIVE: always confirm the exact permit/visa (tourist, irregular, \
             student, arraigo, etc.), whether it is valid or expired, and when it expires.\n\
             - Ask follow-up questions until you have a precise picture of their legal situation \
             before moving to any other topic.\n\
             - If the answer is vague, explicitly ask for clarifications (type of document, expiry \
             date, if they are overstaying, etc.).\n\
             3. Job offer/funds.\n\
             4. Criminal record.\n\
             Keep a professional but warm tone.\n\
             Summaries must explicitly mention the legal status you gathered.\n\
             When you have the info, call 'complete_evaluation'.",
            name = self.name,
            code = self.code,
            upper = self.name.to_uppercase(),
        )
    }
}

impl Default for Language {
    fn default() -> Self {
        FALLBACK
    }
}
