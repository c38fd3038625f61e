use super::{parser::CommandParser, CliError, CLI_BUFFER_SIZE, MAX_HISTORY_SIZE};

/// Byte transport under the console.
pub trait SerialPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), CliError>;

    /// One byte if available, without waiting.
    fn read_byte(&mut self) -> Result<Option<u8>, CliError>;
}

#[cfg(target_os = "espidf")]
pub struct UartPort<'d> {
    tx: esp_idf_hal::uart::UartTxDriver<'d>,
    rx: esp_idf_hal::uart::UartRxDriver<'d>,
}

#[cfg(target_os = "espidf")]
impl<'d> UartPort<'d> {
    pub fn new(
        tx: esp_idf_hal::uart::UartTxDriver<'d>,
        rx: esp_idf_hal::uart::UartRxDriver<'d>,
    ) -> Self {
        Self { tx, rx }
    }
}

#[cfg(target_os = "espidf")]
impl SerialPort for UartPort<'_> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), CliError> {
        self.tx.write(bytes).map_err(|_| CliError::UartError)?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, CliError> {
        let mut buf = [0u8; 1];
        match self.rx.read(&mut buf, 0) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(_) => Err(CliError::UartError),
        }
    }
}

pub struct Terminal<P: SerialPort> {
    port: P,
    line_buffer: String,
    cursor_pos: usize,
    command_history: Vec<String>,
    history_index: Option<usize>,
    escape_state: EscapeState,
}

#[derive(Clone, Copy, PartialEq)]
enum EscapeState {
    Normal,
    Escape,
    Csi,
}

impl<P: SerialPort> Terminal<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            line_buffer: String::new(),
            cursor_pos: 0,
            command_history: Vec::new(),
            history_index: None,
            escape_state: EscapeState::Normal,
        }
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), CliError> {
        self.port.write(s.as_bytes())
    }

    pub fn write_line(&mut self, s: &str) -> Result<(), CliError> {
        self.write_str(s)?;
        self.write_str("\r\n")
    }

    pub fn print_prompt(&mut self) -> Result<(), CliError> {
        self.write_str("watermeter> ")
    }

    pub fn read_char(&mut self) -> Result<Option<u8>, CliError> {
        self.port.read_byte()
    }

    /// Feed one input byte. Returns the finished line on Enter.
    pub fn handle_char(&mut self, ch: u8) -> Result<Option<String>, CliError> {
        match self.escape_state {
            EscapeState::Normal => match ch {
                b'\r' | b'\n' => {
                    self.write_str("\r\n")?;
                    let command = core::mem::take(&mut self.line_buffer);

                    if !command.is_empty() && self.command_history.last() != Some(&command) {
                        if self.command_history.len() >= MAX_HISTORY_SIZE {
                            self.command_history.remove(0);
                        }
                        self.command_history.push(command.clone());
                    }

                    self.cursor_pos = 0;
                    self.history_index = None;
                    Ok(Some(command))
                }
                b'\x1b' => {
                    self.escape_state = EscapeState::Escape;
                    Ok(None)
                }
                b'\x08' | b'\x7f' => {
                    if self.cursor_pos > 0 {
                        self.delete_char_before_cursor()?;
                    }
                    Ok(None)
                }
                b'\t' => {
                    self.handle_tab_completion()?;
                    Ok(None)
                }
                0x20..=0x7E => {
                    if self.line_buffer.len() < CLI_BUFFER_SIZE - 1 {
                        self.insert_char_at_cursor(ch as char)?;
                    }
                    Ok(None)
                }
                _ => Ok(None),
            },
            EscapeState::Escape => {
                self.escape_state = if ch == b'[' {
                    EscapeState::Csi
                } else {
                    EscapeState::Normal
                };
                Ok(None)
            }
            EscapeState::Csi => {
                self.escape_state = EscapeState::Normal;
                match ch {
                    b'A' => self.handle_history_up()?,
                    b'B' => self.handle_history_down()?,
                    b'C' => self.handle_cursor_right()?,
                    b'D' => self.handle_cursor_left()?,
                    _ => {}
                }
                Ok(None)
            }
        }
    }

    pub fn clear_screen(&mut self) -> Result<(), CliError> {
        self.write_str("\x1b[2J\x1b[H")
    }

    fn handle_tab_completion(&mut self) -> Result<(), CliError> {
        let current_line = self.line_buffer.clone();
        let words: Vec<&str> = current_line.split_whitespace().collect();

        // Only the command word completes
        if !(words.is_empty() || (!current_line.ends_with(' ') && words.len() == 1)) {
            return Ok(());
        }
        let partial = words.first().copied().unwrap_or("");
        let matches = CommandParser::autocomplete(partial);

        match matches.as_slice() {
            [] => {}
            [completion] => {
                let suffix = &completion[partial.len()..];
                for ch in suffix.chars().chain(core::iter::once(' ')) {
                    if self.line_buffer.len() < CLI_BUFFER_SIZE - 1 {
                        self.line_buffer.push(ch);
                        self.cursor_pos += 1;
                        self.port.write(&[ch as u8])?;
                    }
                }
            }
            _ => {
                self.write_str("\r\n")?;
                self.write_str(&matches.join("  "))?;
                self.write_str("\r\n")?;
                self.print_prompt()?;
                self.write_str(&current_line)?;
            }
        }
        Ok(())
    }

    pub fn show_help(&mut self) -> Result<(), CliError> {
        self.write_line("Available commands:")?;
        self.write_line("  help        - Show this help")?;
        self.write_line("  version     - Show firmware version")?;
        self.write_line("  status      - Show system status")?;
        self.write_line("  uptime      - Show system uptime")?;
        self.write_line("  clear       - Clear terminal")?;
        self.write_line("  flow        - Show volume, flow rate and pulse counters")?;
        self.write_line("  wifi_status - Show network mode and association")?;
        self.write_line("  wifi_reset  - Erase WiFi settings and open the config portal")?;
        self.write_line("  mqtt_status - Show MQTT connection status")?;
        self.write_line("  checkpoint  - Save cumulative volume now")?;
        self.write_line("  reboot      - Save volume and restart")?;
        self.write_line("")?;
        self.write_line("Use TAB to autocomplete commands")?;
        self.write_line("Use UP/DOWN arrows to navigate command history")?;
        self.write_line("Use LEFT/RIGHT arrows to move cursor and edit")?;
        Ok(())
    }

    fn handle_history_up(&mut self) -> Result<(), CliError> {
        if self.command_history.is_empty() {
            return Ok(());
        }

        let new_index = match self.history_index {
            None => self.command_history.len() - 1,
            Some(0) => return Ok(()),
            Some(current) => current - 1,
        };

        self.history_index = Some(new_index);
        let line = self.command_history[new_index].clone();
        self.replace_current_line(&line)
    }

    fn handle_history_down(&mut self) -> Result<(), CliError> {
        let Some(current) = self.history_index else {
            return Ok(());
        };
        let new_index = (current + 1 < self.command_history.len()).then_some(current + 1);
        self.history_index = new_index;

        let line = new_index
            .map(|idx| self.command_history[idx].clone())
            .unwrap_or_default();
        self.replace_current_line(&line)
    }

    fn replace_current_line(&mut self, new_line: &str) -> Result<(), CliError> {
        for _ in 0..self.cursor_pos {
            self.write_str("\x08 \x08")?;
        }

        self.line_buffer.clear();
        self.line_buffer.push_str(new_line);
        self.cursor_pos = new_line.len();

        self.write_str(new_line)
    }

    fn handle_cursor_right(&mut self) -> Result<(), CliError> {
        if self.cursor_pos < self.line_buffer.len() {
            self.cursor_pos += 1;
            self.write_str("\x1b[C")?;
        }
        Ok(())
    }

    fn handle_cursor_left(&mut self) -> Result<(), CliError> {
        if self.cursor_pos > 0 {
            self.cursor_pos -= 1;
            self.write_str("\x1b[D")?;
        }
        Ok(())
    }

    fn insert_char_at_cursor(&mut self, ch: char) -> Result<(), CliError> {
        if self.cursor_pos == self.line_buffer.len() {
            self.line_buffer.push(ch);
            self.cursor_pos += 1;
            self.port.write(&[ch as u8])
        } else {
            self.line_buffer.insert(self.cursor_pos, ch);
            self.cursor_pos += 1;

            // Redraw the tail starting at the inserted char, then step back
            let tail = self.line_buffer[self.cursor_pos - 1..].to_string();
            self.write_str(&tail)?;
            for _ in 1..tail.len() {
                self.write_str("\x1b[D")?;
            }
            Ok(())
        }
    }

    fn delete_char_before_cursor(&mut self) -> Result<(), CliError> {
        if self.cursor_pos == self.line_buffer.len() {
            self.line_buffer.pop();
            self.cursor_pos -= 1;
            self.write_str("\x08 \x08")
        } else {
            self.line_buffer.remove(self.cursor_pos - 1);
            self.cursor_pos -= 1;

            self.write_str("\x1b[D")?;
            let tail = self.line_buffer[self.cursor_pos..].to_string();
            self.write_str(&tail)?;
            // Blank the char left over from the longer line
            self.write_str(" ")?;
            for _ in 0..tail.len() + 1 {
                self.write_str("\x1b[D")?;
            }
            Ok(())
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}
