use closure_core::config::EncodingConfig;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const MAX_GEOMETRIC_SIZE: usize = 1024;
pub const MAX_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometricShape {
    #[default]
    Square,
    Circle,
    Triangle,
    Spiral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum PatternSpec {
    Geometric {
        #[serde(default)]
        shape: GeometricShape,
        size: usize,
    },
    Morse {
        message: String,
    },
    Binary {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitRequest {
    pub pattern: PatternSpec,
    pub power_mw: f64,
}

/// On/off step sequence plus what it costs to run it.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternTiming {
    pub steps: Vec<bool>,
    pub pulses: usize,
    pub gaps: usize,
    pub pulse_ms: u64,
    pub gap_ms: u64,
    pub duration_ms: f64,
    pub duty_percent: f64,
}

fn morse_symbols(c: char) -> Option<&'static str> {
    Some(match c.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        _ => return None,
    })
}

fn encode_morse(message: &str) -> Vec<bool> {
    let mut steps = Vec::new();
    for (w, word) in message.split_whitespace().enumerate() {
        if w > 0 {
            steps.extend([false; 7]);
        }
        let mut first_letter = true;
        for c in word.chars() {
            let Some(symbols) = morse_symbols(c) else {
                continue;
            };
            if !first_letter {
                steps.extend([false; 3]);
            }
            first_letter = false;
            for (i, s) in symbols.chars().enumerate() {
                if i > 0 {
                    steps.push(false);
                }
                match s {
                    '-' => steps.extend([true; 3]),
                    _ => steps.push(true),
                }
            }
        }
    }
    steps
}

fn encode_binary(message: &str) -> Vec<bool> {
    let mut steps = Vec::with_capacity(message.len() * 9);
    for byte in message.bytes() {
        for bit in (0..8).rev() {
            steps.push(byte & (1 << bit) != 0);
        }
        steps.push(false);
    }
    steps
}

impl PatternSpec {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PatternSpec::Geometric { size, .. } if *size > MAX_GEOMETRIC_SIZE => Err(format!(
                "geometric size {size} exceeds {MAX_GEOMETRIC_SIZE}"
            )),
            PatternSpec::Morse { message } | PatternSpec::Binary { message }
                if message.len() > MAX_MESSAGE_LEN =>
            {
                Err(format!("message longer than {MAX_MESSAGE_LEN} bytes"))
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Vec<bool> {
        match self {
            PatternSpec::Geometric { shape, size } => {
                let n = *size;
                match shape {
                    GeometricShape::Square => (0..n).map(|i| i % 2 == 0).collect(),
                    GeometricShape::Circle => (0..n)
                        .map(|i| (2.0 * PI * i as f64 / n as f64).sin() > 0.0)
                        .collect(),
                    GeometricShape::Triangle => (0..n).map(|i| i < n / 2).collect(),
                    GeometricShape::Spiral => {
                        let side = (n as f64).sqrt() as usize;
                        (0..side)
                            .flat_map(|row| (0..side).map(move |col| (row + col) % 2 == 0))
                            .collect()
                    }
                }
            }
            PatternSpec::Morse { message } => encode_morse(message),
            PatternSpec::Binary { message } => encode_binary(message),
        }
    }

    pub fn timing(&self, encoding: &EncodingConfig) -> PatternTiming {
        let steps = self.encode();
        let pulses = steps.iter().filter(|on| **on).count();
        let gaps = steps.len() - pulses;
        let on_ms = pulses as f64 * encoding.pulse_duration_ms as f64;
        let duration_ms = on_ms + gaps as f64 * encoding.gap_duration_ms as f64;
        let duty_percent = if duration_ms > 0.0 {
            on_ms / duration_ms * 100.0
        } else {
            0.0
        };
        PatternTiming {
            steps,
            pulses,
            gaps,
            pulse_ms: encoding.pulse_duration_ms,
            gap_ms: encoding.gap_duration_ms,
            duration_ms,
            duty_percent,
        }
    }
}
