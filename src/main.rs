// Note: Game BoyTM, Game Boy PocketTM, Super Game BoyTM and Game Boy ColorTM are registered trademarks of
// Nintendo CO., LTD. © 1989 to 1999 by Nintendo CO., LTD.

#[cfg(feature = "gui")]
fn main() {
    use dotmatrix::convention::{SCREEN_H, SCREEN_W};
    use dotmatrix::joypad::JoypadKey;
    use dotmatrix::motherboard::MotherBoard;
    use std::time::{Duration, Instant};

    // LEVEL selects log verbosity: Debug, Info or Silent.
    let level = std::env::var("LEVEL").unwrap_or_else(|_| String::from("Debug"));
    if level == "Debug" {
        rog::reg("dotmatrix");
        rog::reg("dotmatrix::cartridge");
        rog::reg("dotmatrix::motherboard");
    }

    let mut rom = String::from("");
    let mut c_scale: u32 = 2;
    {
        let mut ap = argparse::ArgumentParser::new();
        ap.set_description("DMG emulator");
        ap.refer(&mut c_scale).add_option(
            &["-x", "--scale-factor"],
            argparse::Store,
            "Scale the video by a factor of 1, 2, 4 or 8",
        );
        ap.refer(&mut rom).add_argument("rom", argparse::Store, "Rom path");
        ap.parse_args_or_exit();
    }

    let mut mbrd = match MotherBoard::power_up(&rom) {
        Ok(mbrd) => mbrd,
        Err(err) => {
            rog::println!("ERROR: {}", err);
            std::process::exit(1);
        }
    };

    let mut option = minifb::WindowOptions::default();
    option.resize = true;
    option.scale = match c_scale {
        1 => minifb::Scale::X1,
        2 => minifb::Scale::X2,
        4 => minifb::Scale::X4,
        8 => minifb::Scale::X8,
        _ => {
            rog::println!("ERROR: supported scale factors are 1, 2, 4 or 8");
            std::process::exit(1);
        }
    };
    let mut window =
        minifb::Window::new(format!("Game Boy - {}", mbrd.title()).as_str(), SCREEN_W, SCREEN_H, option).unwrap();
    let mut window_buffer = vec![0x00u32; SCREEN_W * SCREEN_H];
    window.update_with_buffer(window_buffer.as_slice()).unwrap();

    let keys = [
        (minifb::Key::Right, JoypadKey::Right),
        (minifb::Key::Up, JoypadKey::Up),
        (minifb::Key::Left, JoypadKey::Left),
        (minifb::Key::Down, JoypadKey::Down),
        (minifb::Key::Z, JoypadKey::B),
        (minifb::Key::X, JoypadKey::A),
        (minifb::Key::RightShift, JoypadKey::Select),
        (minifb::Key::Enter, JoypadKey::Start),
    ];

    loop {
        if !window.is_open() || window.is_key_down(minifb::Key::Escape) {
            break;
        }
        let frame_begin = Instant::now();

        match mbrd.next_frame() {
            Ok(data) => {
                // The core stores the bottom scanline first; blit top-down.
                let mut i: usize = 0;
                for line in data.iter().rev() {
                    for px in line.iter() {
                        window_buffer[i] =
                            0xff00_0000 | (u32::from(px[0]) << 16) | (u32::from(px[1]) << 8) | u32::from(px[2]);
                        i += 1;
                    }
                }
            }
            Err(err) => {
                rog::println!("ERROR: {}", err);
                std::process::exit(1);
            }
        }
        window.update_with_buffer(window_buffer.as_slice()).unwrap();

        for (rk, vk) in &keys {
            if window.is_key_down(*rk) {
                mbrd.keydown(*vk);
            } else {
                mbrd.keyup(*vk);
            }
        }

        // ~59.7 Hz pacing.
        let elapsed = frame_begin.elapsed();
        if elapsed < Duration::from_millis(16) {
            std::thread::sleep(Duration::from_millis(16) - elapsed);
        }
    }
}

#[cfg(not(feature = "gui"))]
fn main() {
    rog::println!("dotmatrix was built without the gui feature");
}
