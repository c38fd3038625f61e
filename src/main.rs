#[cfg(target_os = "espidf")]
mod firmware {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::gpio::{Gpio13, Input, InterruptType, PinDriver, Pull};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::sys;
    use watermeter::cli::{CommandHandler, CommandParser, ConsoleAction, Terminal, UartPort};
    use watermeter::clock::EspClock;
    use watermeter::meter::{pulse_channel, PulseQueue};
    use watermeter::mqtt::EspBroker;
    use watermeter::network_config::DeviceConfig;
    use watermeter::storage::{DualSlotStore, NvsStore};
    use watermeter::supervisor::{Hardware, ResetPin, Supervisor, SupervisorConfig};
    use watermeter::wifi::EspRadio;

    type Firmware = Supervisor<
        'static,
        EspClock,
        EspRadio,
        EspBroker,
        DualSlotStore<NvsStore>,
        ResetPin<PinDriver<'static, Gpio13, Input>>,
    >;

    pub fn run() -> anyhow::Result<()> {
        // Initialize ESP-IDF system services
        sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();

        log::info!("ESP32 Water Meter v{}", env!("CARGO_PKG_VERSION"));
        log::info!("Initializing...");

        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let nvs_partition = EspDefaultNvsPartition::take()?;

        let device = DeviceConfig::default();
        let config = SupervisorConfig::default();

        // UART0 for the console (USB-C connection)
        let uart_config = UartConfig::new().baudrate(115200.into());
        let mut uart = UartDriver::new(
            peripherals.uart0,
            peripherals.pins.gpio1, // TX (U0TXD)
            peripherals.pins.gpio3, // RX (U0RXD)
            Option::<esp_idf_hal::gpio::Gpio0>::None,
            Option::<esp_idf_hal::gpio::Gpio0>::None,
            &uart_config,
        )?;
        let (uart_tx, uart_rx) = uart.split();
        log::info!("✅ UART0 initialized (115200 baud)");

        let store = DualSlotStore::new(NvsStore::new(nvs_partition.clone())?);
        let radio = EspRadio::new(peripherals.modem, sysloop, nvs_partition)?;

        log::info!("  Pulse input: GPIO{} (falling edge)", device.pulse_pin);
        log::info!("  WiFi reset input: GPIO{} (active low)", device.reset_pin);

        let mut reset_pin = PinDriver::input(peripherals.pins.gpio13)?;
        reset_pin.set_pull(Pull::Up)?;

        // The queue lives for the whole program; the ISR owns its producer half
        let queue: &'static mut PulseQueue = Box::leak(Box::new(PulseQueue::new()));
        let (mut capture, drain) = pulse_channel(queue, config.meter.debounce);

        let mut pulse_pin = PinDriver::input(peripherals.pins.gpio4)?;
        pulse_pin.set_pull(Pull::Up)?;
        pulse_pin.set_interrupt_type(InterruptType::NegEdge)?;
        // SAFETY: the callback only touches the lock-free producer and atomics
        unsafe {
            pulse_pin.subscribe(move || {
                capture.on_edge(EspClock::now_raw());
            })?;
        }
        pulse_pin.enable_interrupt()?;
        log::info!("✅ Pulse capture armed");

        let cycle_interval = config.cycle_interval;
        let mut supervisor: Firmware = Supervisor::boot(
            config,
            device,
            Hardware {
                clock: EspClock,
                drain,
                radio,
                broker: EspBroker::new(),
                store,
                reset: ResetPin::new(reset_pin),
            },
        );

        let mut terminal = Terminal::new(UartPort::new(uart_tx, uart_rx));
        let mut command_handler = CommandHandler::new();

        terminal.write_line("")?;
        terminal.write_line("ESP32 Water Meter")?;
        terminal.write_line("Type 'help' for available commands")?;
        terminal.print_prompt()?;

        log::info!("Entering main loop...");
        let mut last_cycle = EspClock::now_raw();
        loop {
            // The GPIO driver disarms the interrupt after each edge
            if let Err(e) = pulse_pin.enable_interrupt() {
                log::warn!("Meter: Re-arming pulse interrupt failed: {:?}", e);
            }

            let now = EspClock::now_raw();
            if now.since(last_cycle) >= cycle_interval {
                last_cycle = now;
                let report = supervisor.cycle();
                if report.pulses > 0 {
                    log::debug!("Meter: {} pulse(s) drained", report.pulses);
                }
            }

            match terminal.read_char() {
                Ok(Some(ch)) => match terminal.handle_char(ch) {
                    Ok(Some(line)) => {
                        run_command(&mut terminal, &mut command_handler, &mut supervisor, &line);
                        let _ = terminal.print_prompt();
                    }
                    Ok(None) => {}
                    Err(_) => {
                        log::warn!("Terminal input error");
                        let _ = terminal.write_line("Input error");
                        let _ = terminal.print_prompt();
                    }
                },
                Ok(None) | Err(_) => FreeRtos::delay_ms(10),
            }
        }
    }

    fn run_command(
        terminal: &mut Terminal<UartPort<'_>>,
        handler: &mut CommandHandler,
        supervisor: &mut Firmware,
        line: &str,
    ) {
        let command = CommandParser::parse_command(line);
        let response = handler.execute_command(command, &supervisor.snapshot());
        if !response.text.is_empty() {
            let _ = terminal.write_line(&response.text);
        }

        match response.action {
            ConsoleAction::None => {}
            ConsoleAction::ShowHelp => {
                let _ = terminal.show_help();
            }
            ConsoleAction::ClearScreen => {
                let _ = terminal.clear_screen();
            }
            ConsoleAction::Checkpoint => {
                let _ = match supervisor.checkpoint() {
                    Ok(()) => terminal.write_line("✅ Volume saved"),
                    Err(e) => terminal.write_line(&format!("❌ Checkpoint failed: {}", e)),
                };
            }
            ConsoleAction::WifiReset => supervisor.request_reset(),
            ConsoleAction::Reboot => {
                if let Err(e) = supervisor.shutdown() {
                    log::error!("Meter: Final checkpoint failed: {}", e);
                }
                FreeRtos::delay_ms(100);
                unsafe {
                    esp_idf_svc::sys::esp_restart();
                }
            }
        }
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    println!("watermeter is ESP32 firmware; build it for an espidf target (run `cargo test` for the host-side suite)");
}
